//! Payment ledger entries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::FeeRecord;

/// Payment status. `Pending` may move to either terminal state; terminal
/// states never move again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Rejected => "rejected",
        }
    }

    /// Strict parse; `completed` is accepted as a legacy alias of `confirmed`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "confirmed" | "completed" => Some(PaymentStatus::Confirmed),
            "rejected" => Some(PaymentStatus::Rejected),
            _ => None,
        }
    }

    /// Whether moving `self -> to` is allowed. Staying put is always allowed
    /// so notes can be edited and retries are harmless.
    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        *self == to || *self == PaymentStatus::Pending
    }

    /// Whether moving `self -> to` applies the payment to a fee record.
    pub fn reconciles_on(&self, to: PaymentStatus) -> bool {
        *self == PaymentStatus::Pending && to == PaymentStatus::Confirmed
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only record of money received. Only `status` and `notes` change
/// after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: Uuid,
    pub student_id: Uuid,
    pub semester: Option<String>,
    pub amount: Decimal,
    pub payment_method: String,
    pub reference_number: String,
    pub payment_date: DateTime<Utc>,
    pub status: PaymentStatus,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentRecord {
    /// Same student, semester and amount: a resubmission rather than a new
    /// payment reusing someone else's reference.
    pub fn is_replay_of(&self, other: &NewPayment) -> bool {
        self.student_id == other.student_id
            && self.semester == other.semester
            && self.amount == other.amount
    }
}

/// Input for appending a payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub student_id: Uuid,
    pub semester: Option<String>,
    pub amount: Decimal,
    pub payment_method: String,
    pub reference_number: String,
    pub payment_date: DateTime<Utc>,
    pub status: PaymentStatus,
    pub notes: Option<String>,
}

/// Result of appending a payment. Confirmed inserts are reconciled in the
/// same unit of work, so `fee_record` is the post-increment row.
#[derive(Debug, Clone)]
pub enum PaymentInsert {
    Inserted {
        payment: PaymentRecord,
        fee_record: Option<FeeRecord>,
    },
    /// A confirmed payment had no fee record to reconcile against. Nothing
    /// was written.
    FeeRecordMissing,
    /// The reference number is taken. Nothing was written.
    DuplicateReference(PaymentRecord),
}

/// Result of a conditional status update.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub payment: PaymentRecord,
    pub previous: PaymentStatus,
    /// Fee record after reconciliation, when the change reconciled.
    pub fee_record: Option<FeeRecord>,
}
