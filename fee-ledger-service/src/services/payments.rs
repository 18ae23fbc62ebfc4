//! Payment Recorder.
//!
//! Appends payment ledger entries and drives the pending/confirmed/rejected
//! state machine. Reconciliation into `paid_amount` happens inside the store
//! in the same unit of work as the insert or the status change.

use crate::models::money::storable_amount;
use crate::models::{FeeRecord, NewPayment, PaymentInsert, PaymentRecord, PaymentStatus, Student};
use crate::services::metrics::{
    record_payment, record_payment_transition, record_reconciled_amount,
};
use crate::services::notifier::{Notice, NoticeCategory, Notifier};
use crate::services::store::LedgerStore;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const DEFAULT_METHOD: &str = "cash";
pub(crate) const MAX_REFERENCE_ATTEMPTS: usize = 5;

/// Administrator-entered payment; confirmed on insert.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub student_id: Uuid,
    pub semester: String,
    pub amount: Decimal,
    pub payment_method: Option<String>,
    pub reference_number: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Student-submitted payment awaiting finance approval.
#[derive(Debug, Clone)]
pub struct PaymentSubmission {
    pub student_id: Uuid,
    pub semester: Option<String>,
    pub amount: Decimal,
    pub payment_method: Option<String>,
    pub reference_number: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordedPayment {
    pub payment: PaymentRecord,
    /// Fee record after reconciliation; `None` for pending payments.
    pub fee_record: Option<FeeRecord>,
    /// The reference was already recorded for this same payment; nothing new
    /// was written.
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub payment: PaymentRecord,
    pub previous: PaymentStatus,
    pub fee_record: Option<FeeRecord>,
}

impl StatusUpdate {
    pub fn changed(&self) -> bool {
        self.previous != self.payment.status
    }
}

#[derive(Debug, Clone)]
pub struct Verification {
    pub found: bool,
    pub payment: Option<PaymentRecord>,
    pub student: Option<Student>,
}

/// `ADM-{epoch_ms}`.
pub fn generated_reference(epoch_ms: i64) -> String {
    format!("ADM-{}", epoch_ms)
}

fn positive(amount: Decimal) -> Result<Decimal, AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Payment amount must be greater than zero"
        )));
    }
    storable_amount(amount, "Payment amount")
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn payment_notice(payment: &PaymentRecord, title: &str, text: &str) -> Notice {
    let semester = payment
        .semester
        .as_deref()
        .map(|s| format!(" for {}", s))
        .unwrap_or_default();

    Notice::new(
        payment.student_id,
        NoticeCategory::Payment,
        title,
        format!(
            "Your payment of {}{} {}. Reference: {}.",
            payment.amount, semester, text, payment.reference_number
        ),
    )
    .with_metadata("payment_id", payment.payment_id)
    .with_metadata("status", payment.status)
}

#[derive(Clone)]
pub struct PaymentRecorder {
    store: Arc<dyn LedgerStore>,
    notifier: Notifier,
}

impl PaymentRecorder {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Record a confirmed payment and apply it to the student's bill for the
    /// semester. The semester must already be billed.
    #[instrument(skip(self, request), fields(student_id = %request.student_id, semester = %request.semester, amount = %request.amount))]
    pub async fn record_payment(&self, request: PaymentRequest) -> Result<RecordedPayment, AppError> {
        let amount = positive(request.amount)?;
        let semester = request.semester.trim().to_string();
        if semester.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("semester is required")));
        }

        self.store
            .get_student(request.student_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Student not found")))?;

        if self
            .store
            .find_fee_record(request.student_id, &semester)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "No fee record for semester {}",
                semester
            )));
        }

        let payment = NewPayment {
            student_id: request.student_id,
            semester: Some(semester),
            amount,
            payment_method: trimmed(request.payment_method)
                .unwrap_or_else(|| DEFAULT_METHOD.to_string()),
            reference_number: String::new(),
            payment_date: request.payment_date.unwrap_or_else(Utc::now),
            status: PaymentStatus::Confirmed,
            notes: trimmed(request.notes),
        };

        let recorded = self
            .append(payment, trimmed(request.reference_number))
            .await?;

        if !recorded.replayed {
            self.notifier.send(payment_notice(
                &recorded.payment,
                "Payment Recorded",
                "has been received and applied to your account",
            ));
        }

        Ok(recorded)
    }

    /// Record a payment as pending. It counts toward nothing until a finance
    /// officer confirms it.
    #[instrument(skip(self, submission), fields(student_id = %submission.student_id, amount = %submission.amount))]
    pub async fn submit_payment(
        &self,
        submission: PaymentSubmission,
    ) -> Result<RecordedPayment, AppError> {
        let amount = positive(submission.amount)?;

        self.store
            .get_student(submission.student_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Student not found")))?;

        let payment = NewPayment {
            student_id: submission.student_id,
            semester: trimmed(submission.semester),
            amount,
            payment_method: trimmed(submission.payment_method)
                .unwrap_or_else(|| DEFAULT_METHOD.to_string()),
            reference_number: String::new(),
            payment_date: submission.payment_date.unwrap_or_else(Utc::now),
            status: PaymentStatus::Pending,
            notes: trimmed(submission.notes),
        };

        self.append(payment, trimmed(submission.reference_number))
            .await
    }

    /// Insert with a client reference, or with a generated one that moves to
    /// the next millisecond on collision.
    async fn append(
        &self,
        mut payment: NewPayment,
        client_reference: Option<String>,
    ) -> Result<RecordedPayment, AppError> {
        let supplied = client_reference.is_some();
        let mut epoch_ms = Utc::now().timestamp_millis();
        payment.reference_number =
            client_reference.unwrap_or_else(|| generated_reference(epoch_ms));

        for _ in 0..MAX_REFERENCE_ATTEMPTS {
            match self.store.insert_payment(&payment).await? {
                PaymentInsert::Inserted {
                    payment: record,
                    fee_record,
                } => {
                    record_payment(&record.payment_method, record.status.as_str());
                    if fee_record.is_some() {
                        record_reconciled_amount(
                            &record.payment_method,
                            record.amount.to_f64().unwrap_or(0.0),
                        );
                    }
                    info!(
                        payment_id = %record.payment_id,
                        reference = %record.reference_number,
                        status = %record.status,
                        "Payment recorded"
                    );
                    return Ok(RecordedPayment {
                        payment: record,
                        fee_record,
                        replayed: false,
                    });
                }
                PaymentInsert::FeeRecordMissing => {
                    return Err(AppError::NotFound(anyhow::anyhow!(
                        "No fee record for semester {}",
                        payment.semester.as_deref().unwrap_or("(latest)")
                    )));
                }
                PaymentInsert::DuplicateReference(existing) if supplied => {
                    if existing.status == payment.status && existing.is_replay_of(&payment) {
                        info!(
                            payment_id = %existing.payment_id,
                            reference = %existing.reference_number,
                            "Payment already recorded under this reference"
                        );
                        let fee_record = match &existing.semester {
                            Some(semester) if existing.status == PaymentStatus::Confirmed => {
                                self.store
                                    .find_fee_record(existing.student_id, semester)
                                    .await?
                            }
                            _ => None,
                        };
                        return Ok(RecordedPayment {
                            payment: existing,
                            fee_record,
                            replayed: true,
                        });
                    }
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Reference number {} is already used by another payment",
                        payment.reference_number
                    )));
                }
                PaymentInsert::DuplicateReference(_) => {
                    warn!(reference = %payment.reference_number, "Generated reference collided");
                    epoch_ms += 1;
                    payment.reference_number = generated_reference(epoch_ms);
                }
            }
        }

        Err(AppError::Conflict(anyhow::anyhow!(
            "Could not allocate a unique reference number"
        )))
    }

    /// Move a payment to `status`. Pending payments may become confirmed or
    /// rejected; terminal payments only accept their own status again, which
    /// updates notes and nothing else. Confirmation reconciles exactly once.
    #[instrument(skip(self, notes))]
    pub async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: &str,
        notes: Option<String>,
    ) -> Result<StatusUpdate, AppError> {
        let target = PaymentStatus::parse(status).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Invalid status '{}'. Must be one of: confirmed, pending, rejected",
                status
            ))
        })?;
        let notes = trimmed(notes);

        // A concurrent change between the read and the conditional update
        // sends us round once more against the fresh status.
        for _ in 0..2 {
            let current = self
                .store
                .get_payment(payment_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

            if !current.status.can_transition_to(target) {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Payment is already {} and cannot be changed to {}",
                    current.status,
                    target
                )));
            }

            let Some(change) = self
                .store
                .transition_payment(payment_id, current.status, target, notes.as_deref())
                .await?
            else {
                continue;
            };

            let update = StatusUpdate {
                payment: change.payment,
                previous: change.previous,
                fee_record: change.fee_record,
            };

            if update.changed() {
                record_payment_transition(update.previous.as_str(), target.as_str());
                if update.fee_record.is_some() {
                    record_reconciled_amount(
                        &update.payment.payment_method,
                        update.payment.amount.to_f64().unwrap_or(0.0),
                    );
                } else if target == PaymentStatus::Confirmed {
                    warn!(
                        student_id = %update.payment.student_id,
                        "Confirmed payment has no fee record to apply to"
                    );
                }

                let notice = match target {
                    PaymentStatus::Confirmed => Some(payment_notice(
                        &update.payment,
                        "Payment Confirmed",
                        "has been confirmed",
                    )),
                    PaymentStatus::Rejected => Some(payment_notice(
                        &update.payment,
                        "Payment Rejected",
                        "has been rejected. Please contact the finance office",
                    )),
                    PaymentStatus::Pending => None,
                };
                if let Some(notice) = notice {
                    self.notifier.send(notice);
                }
            }

            info!(
                previous = %update.previous,
                status = %target,
                reconciled = update.fee_record.is_some(),
                "Payment status updated"
            );
            return Ok(update);
        }

        Err(AppError::Conflict(anyhow::anyhow!(
            "Payment status changed concurrently; retry the request"
        )))
    }

    /// Look a payment up by reference. When a registration number is given
    /// the payment only counts as found if it belongs to that student.
    #[instrument(skip(self))]
    pub async fn verify_payment(
        &self,
        reference_number: &str,
        registration_number: Option<&str>,
    ) -> Result<Verification, AppError> {
        let reference_number = reference_number.trim();
        if reference_number.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "reference_number is required"
            )));
        }

        let not_found = Verification {
            found: false,
            payment: None,
            student: None,
        };

        let Some(payment) = self
            .store
            .find_payment_by_reference(reference_number)
            .await?
        else {
            return Ok(not_found);
        };

        let student = self.store.get_student(payment.student_id).await?;

        if let Some(registration) = registration_number.map(str::trim).filter(|r| !r.is_empty()) {
            let matches = student
                .as_ref()
                .map(|s| s.registration_number.eq_ignore_ascii_case(registration))
                .unwrap_or(false);
            if !matches {
                return Ok(not_found);
            }
        }

        Ok(Verification {
            found: true,
            payment: Some(payment),
            student,
        })
    }
}
