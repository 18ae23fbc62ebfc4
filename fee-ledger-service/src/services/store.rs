//! Ledger store seam.
//!
//! Every method that changes `paid_amount` does so as one atomic unit inside
//! the store: callers never read a paid total, add to it and write it back.

use crate::models::{
    BillWrite, BulkBill, FeeRecord, NewPayment, PaymentInsert, PaymentRecord, PaymentStatus, StatusChange,
    Student, UpsertBill,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashSet;
use uuid::Uuid;

/// Working set used by reports. May be stale with respect to concurrent
/// writes.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub students: Vec<Student>,
    pub fee_records: Vec<FeeRecord>,
    pub payments: Vec<PaymentRecord>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Students
    async fn insert_student(&self, student: &Student) -> Result<Student, AppError>;
    async fn get_student(&self, student_id: Uuid) -> Result<Option<Student>, AppError>;
    async fn get_students(&self, student_ids: &[Uuid]) -> Result<Vec<Student>, AppError>;
    async fn list_students(&self) -> Result<Vec<Student>, AppError>;

    // Fee records
    async fn get_fee_record(&self, fee_id: Uuid) -> Result<Option<FeeRecord>, AppError>;
    async fn find_fee_record(
        &self,
        student_id: Uuid,
        semester: &str,
    ) -> Result<Option<FeeRecord>, AppError>;
    async fn list_fee_records(&self, semester: Option<&str>) -> Result<Vec<FeeRecord>, AppError>;
    async fn list_student_fee_records(&self, student_id: Uuid)
        -> Result<Vec<FeeRecord>, AppError>;

    /// Subset of `student_ids` that already have a fee record for `semester`.
    async fn billed_student_ids(
        &self,
        semester: &str,
        student_ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, AppError>;

    /// Bill one student in one unit of work. A new row starts at
    /// `paid_amount = 0` and, when `opening` is given, takes that confirmed
    /// payment before the unit commits. An existing row is re-billed only
    /// when `replace` is set, keeping its `paid_amount` and, absent a new
    /// one, its due date. Whether the row was created is decided by the
    /// write itself, not by an earlier read.
    async fn write_bill(
        &self,
        bill: &UpsertBill,
        replace: bool,
        opening: Option<&NewPayment>,
    ) -> Result<BillWrite, AppError>;

    /// Insert-or-re-bill for many students in one statement, with the same
    /// rules as [`LedgerStore::write_bill`] under `replace`.
    async fn bulk_upsert_fee_records(&self, bill: &BulkBill) -> Result<Vec<FeeRecord>, AppError>;

    /// Change the billed amount, and the due date when one is given. Returns
    /// the previous billed amount with the updated row, or `None` when
    /// `fee_id` does not resolve. `paid_amount` is never touched.
    async fn update_fee_record(
        &self,
        fee_id: Uuid,
        billed_amount: Decimal,
        due_date: Option<chrono::NaiveDate>,
    ) -> Result<Option<(Decimal, FeeRecord)>, AppError>;

    // Payments
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<PaymentRecord>, AppError>;
    async fn find_payment_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<PaymentRecord>, AppError>;
    async fn list_payments(&self) -> Result<Vec<PaymentRecord>, AppError>;
    async fn list_student_payments(&self, student_id: Uuid)
        -> Result<Vec<PaymentRecord>, AppError>;

    /// Append a payment. A `Confirmed` payment is reconciled in the same unit
    /// of work against `(student_id, semester)`, or against the student's
    /// most recent fee record when no semester is given.
    async fn insert_payment(&self, payment: &NewPayment) -> Result<PaymentInsert, AppError>;

    /// Move a payment from `expected` to `status` only if it is still in
    /// `expected`, reconciling when the move is pending -> confirmed against
    /// the same record [`LedgerStore::insert_payment`] would pick. A named
    /// semester that is not billed fails with `NotFound` and changes nothing.
    /// A payment without a semester takes the semester it was applied to.
    /// Returns `None` when the payment is missing or no longer in `expected`.
    async fn transition_payment(
        &self,
        payment_id: Uuid,
        expected: PaymentStatus,
        status: PaymentStatus,
        notes: Option<&str>,
    ) -> Result<Option<StatusChange>, AppError>;
}

/// Fee record a confirmed payment reconciles against: the named semester
/// only, or the most recent record when no semester is given.
pub(crate) fn reconciliation_target<'a>(
    records: &[&'a FeeRecord],
    semester: Option<&str>,
) -> Option<&'a FeeRecord> {
    match semester {
        Some(semester) => records.iter().copied().find(|r| r.semester == semester),
        None => most_recent(records),
    }
}

pub(crate) fn semester_not_billed(semester: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("No fee record for semester {}", semester))
}

/// Latest by creation time; later entries win ties.
fn most_recent<'a>(records: &[&'a FeeRecord]) -> Option<&'a FeeRecord> {
    records.iter().copied().max_by_key(|r| r.created_utc)
}
