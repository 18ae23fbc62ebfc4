//! Fee record model: one bill per student per semester.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::PaymentRecord;

/// Amount billed to a student for a semester and the running total paid
/// against it. `(student_id, semester)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeeRecord {
    pub fee_id: Uuid,
    pub student_id: Uuid,
    pub semester: String,
    pub billed_amount: Decimal,
    pub paid_amount: Decimal,
    pub due_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FeeRecord {
    /// Outstanding amount; negative when overpaid.
    pub fn balance(&self) -> Decimal {
        self.billed_amount - self.paid_amount
    }
}

/// Input for billing a single student. Existing rows keep their paid amount,
/// and their due date when `due_date` is `None`.
#[derive(Debug, Clone)]
pub struct UpsertBill {
    pub student_id: Uuid,
    pub semester: String,
    pub billed_amount: Decimal,
    pub due_date: Option<NaiveDate>,
}

/// Result of writing one student's bill in a single unit of work.
#[derive(Debug, Clone)]
pub enum BillWrite {
    /// New row, with its opening payment when one was asked for.
    Created {
        record: FeeRecord,
        opening_payment: Option<PaymentRecord>,
    },
    /// Existing row re-billed; `paid_amount` kept.
    Replaced {
        record: FeeRecord,
        previous_amount: Decimal,
    },
    /// Existing row left alone because replacement was not asked for.
    Unchanged(FeeRecord),
    /// The opening payment's reference is taken. Nothing was written.
    OpeningReferenceTaken,
}

/// Input for one batched upsert over many students.
#[derive(Debug, Clone)]
pub struct BulkBill {
    pub student_ids: Vec<Uuid>,
    pub semester: String,
    pub billed_amount: Decimal,
    pub due_date: Option<NaiveDate>,
}
