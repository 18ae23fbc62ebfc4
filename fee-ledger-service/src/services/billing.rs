//! Billing Manager.
//!
//! Creates and re-bills fee records. Every write goes through the store's
//! bill writes, which never touch `paid_amount` on rows that already exist.

use crate::models::money::storable_amount;
use crate::models::{
    BillWrite, BulkBill, FeeRecord, NewPayment, PaymentRecord, PaymentStatus, Student, UpsertBill,
};
use crate::services::balance::{BalancePolicy, BalanceView};
use crate::services::metrics::{
    record_bill_written, record_bulk_billing, record_payment, record_reconciled_amount,
};
use crate::services::notifier::{Notice, NoticeCategory, Notifier};
use crate::services::payments::{generated_reference, payment_notice, MAX_REFERENCE_ATTEMPTS};
use crate::services::store::LedgerStore;
use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const OPENING_BALANCE_METHOD: &str = "opening_balance";

/// Bill one student for one semester.
#[derive(Debug, Clone)]
pub struct BillRequest {
    pub student_id: Uuid,
    pub semester: String,
    pub billed_amount: Decimal,
    pub due_date: Option<NaiveDate>,
    pub force_update: bool,
    /// Amount already paid. Recorded as a confirmed payment together with a
    /// newly created bill, and ignored when the bill already exists.
    pub opening_payment: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub enum BillOutcome {
    Created {
        record: FeeRecord,
        opening_payment: Option<PaymentRecord>,
    },
    Updated {
        record: FeeRecord,
        previous_amount: Decimal,
    },
    /// A bill exists and `force_update` was not set. Nothing was written.
    AlreadyBilled(FeeRecord),
}

impl BillOutcome {
    pub fn record(&self) -> &FeeRecord {
        match self {
            BillOutcome::Created { record, .. }
            | BillOutcome::Updated { record, .. }
            | BillOutcome::AlreadyBilled(record) => record,
        }
    }
}

/// Bill many students the same amount for one semester.
#[derive(Debug, Clone)]
pub struct BulkBillRequest {
    pub student_ids: Vec<Uuid>,
    pub semester: String,
    pub billed_amount: Decimal,
    pub due_date: Option<NaiveDate>,
    pub skip_existing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BulkBillOutcome {
    /// Students written by this call, in request order.
    pub processed: Vec<Uuid>,
    /// Already-billed students left untouched because `skip_existing` was set.
    pub skipped: Vec<Uuid>,
    /// Every requested student that had a bill for the semester before the call.
    pub already_billed: Vec<Uuid>,
    pub records: Vec<FeeRecord>,
}

#[derive(Debug, Clone)]
pub struct BillAmendment {
    pub record: FeeRecord,
    pub previous_amount: Decimal,
    pub new_amount: Decimal,
}

/// Fee record joined with its student and derived figures.
#[derive(Debug, Clone)]
pub struct FeeLine {
    pub record: FeeRecord,
    pub student: Option<Student>,
    pub view: BalanceView,
}

/// Everything billed to and paid by one student.
#[derive(Debug, Clone)]
pub struct StudentStatement {
    pub student: Student,
    pub semesters: Vec<(FeeRecord, BalanceView)>,
    pub payments: Vec<PaymentRecord>,
    pub overall: BalanceView,
}

fn required_semester(semester: &str) -> Result<String, AppError> {
    let semester = semester.trim();
    if semester.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("semester is required")));
    }
    Ok(semester.to_string())
}

fn non_negative(amount: Decimal, field: &str) -> Result<Decimal, AppError> {
    if amount < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "{} must be a non-negative number",
            field
        )));
    }
    storable_amount(amount, field)
}

/// Removes repeats, keeping the first occurrence.
fn dedup_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn statement_notice(record: &FeeRecord, created: bool) -> Notice {
    let (title, verb) = if created {
        ("Fee Statement Created", "issued")
    } else {
        ("Fee Statement Updated", "updated")
    };
    let due = record
        .due_date
        .map(|d| format!(" Due date: {}.", d))
        .unwrap_or_default();

    Notice::new(
        record.student_id,
        NoticeCategory::FeeStatement,
        title,
        format!(
            "Your fee statement for {} has been {}. Amount billed: {}.{}",
            record.semester, verb, record.billed_amount, due
        ),
    )
    .with_metadata("fee_id", record.fee_id)
    .with_metadata("semester", &record.semester)
}

#[derive(Clone)]
pub struct BillingManager {
    store: Arc<dyn LedgerStore>,
    notifier: Notifier,
    policy: BalancePolicy,
}

impl BillingManager {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Notifier, policy: BalancePolicy) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    /// Bill a single student. An existing bill is only replaced when
    /// `force_update` is set; otherwise it comes back as `AlreadyBilled`.
    /// A new bill and its opening payment are written together or not at all.
    #[instrument(skip(self, request), fields(student_id = %request.student_id, semester = %request.semester))]
    pub async fn create_or_update_bill(&self, request: BillRequest) -> Result<BillOutcome, AppError> {
        let semester = required_semester(&request.semester)?;
        let billed_amount = non_negative(request.billed_amount, "Fee amount")?;
        let opening_amount = match request.opening_payment {
            Some(amount) => Some(non_negative(amount, "amount_paid")?),
            None => None,
        }
        .filter(|amount| *amount > Decimal::ZERO);

        self.store
            .get_student(request.student_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Student not found")))?;

        let bill = UpsertBill {
            student_id: request.student_id,
            semester,
            billed_amount,
            due_date: request.due_date,
        };

        let mut epoch_ms = Utc::now().timestamp_millis();
        for _ in 0..MAX_REFERENCE_ATTEMPTS {
            let opening = opening_amount.map(|amount| NewPayment {
                student_id: bill.student_id,
                semester: Some(bill.semester.clone()),
                amount,
                payment_method: OPENING_BALANCE_METHOD.to_string(),
                reference_number: generated_reference(epoch_ms),
                payment_date: Utc::now(),
                status: PaymentStatus::Confirmed,
                notes: Some("Amount paid when the fee statement was created".to_string()),
            });

            let written = self
                .store
                .write_bill(&bill, request.force_update, opening.as_ref())
                .await?;

            let outcome = match written {
                BillWrite::OpeningReferenceTaken => {
                    warn!(epoch_ms = epoch_ms, "Generated reference collided");
                    epoch_ms += 1;
                    continue;
                }
                BillWrite::Unchanged(existing) => {
                    info!(fee_id = %existing.fee_id, "Student already billed for semester");
                    BillOutcome::AlreadyBilled(existing)
                }
                BillWrite::Created {
                    record,
                    opening_payment,
                } => {
                    record_bill_written("create", 1);
                    self.notifier.send(statement_notice(&record, true));
                    if let Some(payment) = &opening_payment {
                        record_payment(&payment.payment_method, payment.status.as_str());
                        record_reconciled_amount(
                            &payment.payment_method,
                            payment.amount.to_f64().unwrap_or(0.0),
                        );
                        self.notifier.send(payment_notice(
                            payment,
                            "Payment Recorded",
                            "has been received and applied to your account",
                        ));
                    }
                    BillOutcome::Created {
                        record,
                        opening_payment,
                    }
                }
                BillWrite::Replaced {
                    record,
                    previous_amount,
                } => {
                    record_bill_written("update", 1);
                    self.notifier.send(statement_notice(&record, false));
                    BillOutcome::Updated {
                        record,
                        previous_amount,
                    }
                }
            };

            if opening_amount.is_some() && !matches!(outcome, BillOutcome::Created { .. }) {
                warn!(
                    fee_id = %outcome.record().fee_id,
                    "Opening payment ignored; student already billed"
                );
            }

            info!(
                fee_id = %outcome.record().fee_id,
                billed_amount = %outcome.record().billed_amount,
                created = matches!(outcome, BillOutcome::Created { .. }),
                "Fee record written"
            );
            return Ok(outcome);
        }

        Err(AppError::Conflict(anyhow::anyhow!(
            "Could not allocate a unique reference number"
        )))
    }

    /// Bill a batch of students in one upsert. With `skip_existing`, students
    /// already billed for the semester are reported in `skipped` and left
    /// alone; without it they are re-billed keeping their paid totals.
    #[instrument(skip(self, request), fields(semester = %request.semester, requested = request.student_ids.len()))]
    pub async fn bulk_bill(&self, request: BulkBillRequest) -> Result<BulkBillOutcome, AppError> {
        if request.student_ids.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "student_ids must be a non-empty list"
            )));
        }
        let semester = required_semester(&request.semester)?;
        let billed_amount = non_negative(request.billed_amount, "Fee amount")?;
        let student_ids = dedup_ids(&request.student_ids);

        let known: HashSet<Uuid> = self
            .store
            .get_students(&student_ids)
            .await?
            .into_iter()
            .map(|s| s.student_id)
            .collect();
        let unknown: Vec<String> = student_ids
            .iter()
            .filter(|id| !known.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Unknown students: {}",
                unknown.join(", ")
            )));
        }

        let billed = self.store.billed_student_ids(&semester, &student_ids).await?;
        let already_billed: Vec<Uuid> = student_ids
            .iter()
            .copied()
            .filter(|id| billed.contains(id))
            .collect();

        let (batch, skipped): (Vec<Uuid>, Vec<Uuid>) = if request.skip_existing {
            student_ids.iter().copied().partition(|id| !billed.contains(id))
        } else {
            (student_ids.clone(), Vec::new())
        };

        if batch.is_empty() {
            info!(skipped = skipped.len(), "Nothing to bill; every student already billed");
            record_bulk_billing(0, skipped.len());
            return Ok(BulkBillOutcome {
                processed: Vec::new(),
                skipped,
                already_billed,
                records: Vec::new(),
            });
        }

        let records = self
            .store
            .bulk_upsert_fee_records(&BulkBill {
                student_ids: batch.clone(),
                semester,
                billed_amount,
                due_date: request.due_date,
            })
            .await?;

        record_bill_written("bulk", records.len() as u64);
        record_bulk_billing(batch.len(), skipped.len());

        for record in &records {
            let created = !billed.contains(&record.student_id);
            self.notifier.send(statement_notice(record, created));
        }

        info!(
            processed = batch.len(),
            skipped = skipped.len(),
            "Bulk billing complete"
        );

        Ok(BulkBillOutcome {
            processed: batch,
            skipped,
            already_billed,
            records,
        })
    }

    /// Change the billed amount of one fee record. The due date is replaced
    /// only when given.
    #[instrument(skip(self))]
    pub async fn update_bill(
        &self,
        fee_id: Uuid,
        new_amount: Decimal,
        due_date: Option<NaiveDate>,
    ) -> Result<BillAmendment, AppError> {
        let new_amount = non_negative(new_amount, "Fee amount")?;

        let (previous_amount, record) = self
            .store
            .update_fee_record(fee_id, new_amount, due_date)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Fee record not found")))?;

        record_bill_written("amend", 1);
        self.notifier.send(statement_notice(&record, false));

        info!(
            semester = %record.semester,
            previous_amount = %previous_amount,
            new_amount = %new_amount,
            "Fee record amended"
        );

        Ok(BillAmendment {
            record,
            previous_amount,
            new_amount,
        })
    }

    /// Fee records, optionally for one semester, joined with their students
    /// and ordered by registration number.
    #[instrument(skip(self))]
    pub async fn list_fees(&self, semester: Option<&str>) -> Result<Vec<FeeLine>, AppError> {
        let semester = semester.map(str::trim).filter(|s| !s.is_empty());
        let records = self.store.list_fee_records(semester).await?;

        let student_ids = dedup_ids(&records.iter().map(|r| r.student_id).collect::<Vec<_>>());
        let students: HashMap<Uuid, Student> = self
            .store
            .get_students(&student_ids)
            .await?
            .into_iter()
            .map(|s| (s.student_id, s))
            .collect();

        let today = Utc::now().date_naive();
        let mut lines: Vec<FeeLine> = records
            .into_iter()
            .map(|record| FeeLine {
                view: self.policy.record_view(&record, today),
                student: students.get(&record.student_id).cloned(),
                record,
            })
            .collect();

        lines.sort_by(|a, b| {
            let key = |line: &FeeLine| {
                line.student
                    .as_ref()
                    .map(|s| s.registration_number.clone())
                    .unwrap_or_default()
            };
            key(a)
                .cmp(&key(b))
                .then_with(|| a.record.semester.cmp(&b.record.semester))
        });

        Ok(lines)
    }

    /// Per-semester and cross-semester balances for one student.
    #[instrument(skip(self))]
    pub async fn student_statement(&self, student_id: Uuid) -> Result<StudentStatement, AppError> {
        let student = self
            .store
            .get_student(student_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Student not found")))?;

        let records = self.store.list_student_fee_records(student_id).await?;
        let payments: Vec<PaymentRecord> = self
            .store
            .list_student_payments(student_id)
            .await?
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Confirmed)
            .collect();

        let today = Utc::now().date_naive();
        let overall = self.policy.student_view(&records, &payments, today);
        let semesters = records
            .into_iter()
            .map(|record| {
                let view = self.policy.record_view(&record, today);
                (record, view)
            })
            .collect();

        Ok(StudentStatement {
            student,
            semesters,
            payments,
            overall,
        })
    }
}
