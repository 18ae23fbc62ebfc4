//! In-process ledger store.
//!
//! All tables sit behind one lock; every compound operation holds the write
//! guard for its whole duration, which gives the same atomicity the
//! PostgreSQL store gets from single statements and transactions.

use crate::models::money::add_paid;
use crate::models::{
    BillWrite, BulkBill, FeeRecord, NewPayment, PaymentInsert, PaymentRecord, PaymentStatus,
    StatusChange, Student, UpsertBill,
};
use crate::services::store::{reconciliation_target, semester_not_billed, LedgerStore};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    students: HashMap<Uuid, Student>,
    fee_records: HashMap<Uuid, FeeRecord>,
    fee_order: Vec<Uuid>,
    fee_index: HashMap<(Uuid, String), Uuid>,
    payments: HashMap<Uuid, PaymentRecord>,
    payment_order: Vec<Uuid>,
    references: HashMap<String, Uuid>,
}

fn rebill(record: &mut FeeRecord, bill: &UpsertBill) {
    record.billed_amount = bill.billed_amount;
    if bill.due_date.is_some() {
        record.due_date = bill.due_date;
    }
    record.updated_utc = Utc::now();
}

impl Tables {
    fn student_fee_records(&self, student_id: Uuid) -> Vec<&FeeRecord> {
        self.fee_order
            .iter()
            .filter_map(|id| self.fee_records.get(id))
            .filter(|r| r.student_id == student_id)
            .collect()
    }

    fn create_fee_record(&mut self, bill: &UpsertBill, paid_amount: Decimal) -> FeeRecord {
        let now = Utc::now();
        let record = FeeRecord {
            fee_id: Uuid::new_v4(),
            student_id: bill.student_id,
            semester: bill.semester.clone(),
            billed_amount: bill.billed_amount,
            paid_amount,
            due_date: bill.due_date,
            created_utc: now,
            updated_utc: now,
        };
        self.fee_index
            .insert((bill.student_id, bill.semester.clone()), record.fee_id);
        self.fee_order.push(record.fee_id);
        self.fee_records.insert(record.fee_id, record.clone());
        record
    }

    fn upsert(&mut self, bill: &UpsertBill) -> FeeRecord {
        let key = (bill.student_id, bill.semester.clone());
        if let Some(record) = self
            .fee_index
            .get(&key)
            .and_then(|id| self.fee_records.get_mut(id))
        {
            rebill(record, bill);
            return record.clone();
        }
        self.create_fee_record(bill, Decimal::ZERO)
    }

    fn write_bill(
        &mut self,
        bill: &UpsertBill,
        replace: bool,
        opening: Option<&NewPayment>,
    ) -> Result<BillWrite, AppError> {
        let key = (bill.student_id, bill.semester.clone());
        if let Some(record) = self
            .fee_index
            .get(&key)
            .and_then(|id| self.fee_records.get_mut(id))
        {
            if !replace {
                return Ok(BillWrite::Unchanged(record.clone()));
            }
            let previous_amount = record.billed_amount;
            rebill(record, bill);
            return Ok(BillWrite::Replaced {
                record: record.clone(),
                previous_amount,
            });
        }

        let paid_amount = match opening {
            Some(opening) if self.references.contains_key(&opening.reference_number) => {
                return Ok(BillWrite::OpeningReferenceTaken);
            }
            Some(opening) => add_paid(Decimal::ZERO, opening.amount)?,
            None => Decimal::ZERO,
        };

        let record = self.create_fee_record(bill, paid_amount);
        let opening_payment =
            opening.map(|payment| self.push_payment(payment, Some(record.semester.clone())));

        Ok(BillWrite::Created {
            record,
            opening_payment,
        })
    }

    /// Leaves the row untouched when the new total does not fit.
    fn increment_paid(&mut self, fee_id: Uuid, amount: Decimal) -> Result<Option<FeeRecord>, AppError> {
        let Some(record) = self.fee_records.get_mut(&fee_id) else {
            return Ok(None);
        };
        record.paid_amount = add_paid(record.paid_amount, amount)?;
        record.updated_utc = Utc::now();
        Ok(Some(record.clone()))
    }

    fn push_payment(&mut self, payment: &NewPayment, semester: Option<String>) -> PaymentRecord {
        let now = Utc::now();
        let record = PaymentRecord {
            payment_id: Uuid::new_v4(),
            student_id: payment.student_id,
            semester,
            amount: payment.amount,
            payment_method: payment.payment_method.clone(),
            reference_number: payment.reference_number.clone(),
            payment_date: payment.payment_date,
            status: payment.status,
            notes: payment.notes.clone(),
            created_utc: now,
            updated_utc: now,
        };
        self.references
            .insert(record.reference_number.clone(), record.payment_id);
        self.payment_order.push(record.payment_id);
        self.payments.insert(record.payment_id, record.clone());
        record
    }
}

/// Ledger store kept in memory.
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    #[instrument(skip(self, student), fields(student_id = %student.student_id))]
    async fn insert_student(&self, student: &Student) -> Result<Student, AppError> {
        let mut tables = self.tables.write().await;
        let taken = tables.students.values().any(|s| {
            s.registration_number == student.registration_number
                && s.student_id != student.student_id
        });
        if taken {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Registration number {} already exists",
                student.registration_number
            )));
        }
        tables.students.insert(student.student_id, student.clone());
        Ok(student.clone())
    }

    async fn get_student(&self, student_id: Uuid) -> Result<Option<Student>, AppError> {
        Ok(self.tables.read().await.students.get(&student_id).cloned())
    }

    async fn get_students(&self, student_ids: &[Uuid]) -> Result<Vec<Student>, AppError> {
        let tables = self.tables.read().await;
        Ok(student_ids
            .iter()
            .filter_map(|id| tables.students.get(id).cloned())
            .collect())
    }

    async fn list_students(&self) -> Result<Vec<Student>, AppError> {
        let mut students: Vec<Student> =
            self.tables.read().await.students.values().cloned().collect();
        students.sort_by(|a, b| a.registration_number.cmp(&b.registration_number));
        Ok(students)
    }

    async fn get_fee_record(&self, fee_id: Uuid) -> Result<Option<FeeRecord>, AppError> {
        Ok(self.tables.read().await.fee_records.get(&fee_id).cloned())
    }

    async fn find_fee_record(
        &self,
        student_id: Uuid,
        semester: &str,
    ) -> Result<Option<FeeRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .fee_index
            .get(&(student_id, semester.to_string()))
            .and_then(|id| tables.fee_records.get(id))
            .cloned())
    }

    async fn list_fee_records(&self, semester: Option<&str>) -> Result<Vec<FeeRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .fee_order
            .iter()
            .filter_map(|id| tables.fee_records.get(id))
            .filter(|r| semester.map_or(true, |s| r.semester == s))
            .cloned()
            .collect())
    }

    async fn list_student_fee_records(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<FeeRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .student_fee_records(student_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn billed_student_ids(
        &self,
        semester: &str,
        student_ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, AppError> {
        let tables = self.tables.read().await;
        Ok(student_ids
            .iter()
            .filter(|id| {
                tables
                    .fee_index
                    .contains_key(&(**id, semester.to_string()))
            })
            .copied()
            .collect())
    }

    #[instrument(skip(self, bill, opening), fields(student_id = %bill.student_id, semester = %bill.semester))]
    async fn write_bill(
        &self,
        bill: &UpsertBill,
        replace: bool,
        opening: Option<&NewPayment>,
    ) -> Result<BillWrite, AppError> {
        self.tables.write().await.write_bill(bill, replace, opening)
    }

    #[instrument(skip(self, bill), fields(semester = %bill.semester, count = bill.student_ids.len()))]
    async fn bulk_upsert_fee_records(&self, bill: &BulkBill) -> Result<Vec<FeeRecord>, AppError> {
        let mut tables = self.tables.write().await;
        let records = bill
            .student_ids
            .iter()
            .map(|student_id| {
                tables.upsert(&UpsertBill {
                    student_id: *student_id,
                    semester: bill.semester.clone(),
                    billed_amount: bill.billed_amount,
                    due_date: bill.due_date,
                })
            })
            .collect();
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn update_fee_record(
        &self,
        fee_id: Uuid,
        billed_amount: Decimal,
        due_date: Option<NaiveDate>,
    ) -> Result<Option<(Decimal, FeeRecord)>, AppError> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.fee_records.get_mut(&fee_id) else {
            return Ok(None);
        };
        let previous = record.billed_amount;
        record.billed_amount = billed_amount;
        if due_date.is_some() {
            record.due_date = due_date;
        }
        record.updated_utc = Utc::now();
        Ok(Some((previous, record.clone())))
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<PaymentRecord>, AppError> {
        Ok(self.tables.read().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .references
            .get(reference_number)
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    async fn list_payments(&self) -> Result<Vec<PaymentRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .payment_order
            .iter()
            .filter_map(|id| tables.payments.get(id))
            .cloned()
            .collect())
    }

    async fn list_student_payments(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .payment_order
            .iter()
            .filter_map(|id| tables.payments.get(id))
            .filter(|p| p.student_id == student_id)
            .cloned()
            .collect())
    }

    #[instrument(skip(self, payment), fields(student_id = %payment.student_id, reference = %payment.reference_number))]
    async fn insert_payment(&self, payment: &NewPayment) -> Result<PaymentInsert, AppError> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables
            .references
            .get(&payment.reference_number)
            .and_then(|id| tables.payments.get(id))
        {
            return Ok(PaymentInsert::DuplicateReference(existing.clone()));
        }

        let target = if payment.status == PaymentStatus::Confirmed {
            let records = tables.student_fee_records(payment.student_id);
            match reconciliation_target(&records, payment.semester.as_deref()) {
                Some(record) => Some((record.fee_id, record.semester.clone())),
                None => return Ok(PaymentInsert::FeeRecordMissing),
            }
        } else {
            None
        };

        let fee_record = match &target {
            Some((fee_id, _)) => tables.increment_paid(*fee_id, payment.amount)?,
            None => None,
        };
        let semester = payment
            .semester
            .clone()
            .or_else(|| target.map(|(_, semester)| semester));
        let record = tables.push_payment(payment, semester);

        debug!(payment_id = %record.payment_id, reconciled = fee_record.is_some(), "Payment inserted");

        Ok(PaymentInsert::Inserted {
            payment: record,
            fee_record,
        })
    }

    #[instrument(skip(self, notes))]
    async fn transition_payment(
        &self,
        payment_id: Uuid,
        expected: PaymentStatus,
        status: PaymentStatus,
        notes: Option<&str>,
    ) -> Result<Option<StatusChange>, AppError> {
        let mut tables = self.tables.write().await;

        let Some(current) = tables.payments.get(&payment_id).cloned() else {
            return Ok(None);
        };
        if current.status != expected {
            return Ok(None);
        }

        let target = if expected.reconciles_on(status) {
            let records = tables.student_fee_records(current.student_id);
            match reconciliation_target(&records, current.semester.as_deref()) {
                Some(record) => Some((record.fee_id, record.semester.clone())),
                None => match current.semester.as_deref() {
                    Some(semester) => return Err(semester_not_billed(semester)),
                    None => None,
                },
            }
        } else {
            None
        };

        let fee_record = match &target {
            Some((fee_id, _)) => tables.increment_paid(*fee_id, current.amount)?,
            None => None,
        };

        let payment = {
            let Some(payment) = tables.payments.get_mut(&payment_id) else {
                return Ok(None);
            };
            payment.status = status;
            if let Some(notes) = notes {
                payment.notes = Some(notes.to_string());
            }
            if payment.semester.is_none() {
                payment.semester = target.map(|(_, semester)| semester);
            }
            payment.updated_utc = Utc::now();
            payment.clone()
        };

        Ok(Some(StatusChange {
            payment,
            previous: expected,
            fee_record,
        }))
    }
}
