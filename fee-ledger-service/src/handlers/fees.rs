//! `/fees` endpoints: billing, fee listing, admin payments.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use super::tracked;
use crate::{
    dtos::{
        BulkBillResponse, CreateFeeRequest, CreateFeeResponse, FeeAction, FeeActionResponse,
        FeeListQuery, FeeListResponse, FeeRecordResponse, RecordPaymentRequest,
        RecordPaymentResponse, StudentStatementResponse, UpdateFeeResponse,
    },
    services::{BillOutcome, BillRequest, BulkBillRequest, PaymentRequest},
    startup::AppState,
};

/// Bill one student. An existing bill comes back with a `warning` unless
/// `force_update` is set. `amount_paid` is recorded as a payment together
/// with a new bill; if either write fails neither is kept.
pub async fn create_fee(
    State(state): State<AppState>,
    payload: Result<Json<CreateFeeRequest>, JsonRejection>,
) -> Result<Json<CreateFeeResponse>, AppError> {
    let Json(payload) = payload.map_err(AppError::from).map_err(tracked("create_fee"))?;
    payload.validate().map_err(AppError::from).map_err(tracked("create_fee"))?;

    tracing::info!(
        student_id = %payload.student_id,
        semester = %payload.semester,
        total_fee = %payload.total_fee,
        force_update = payload.force_update,
        "Billing student"
    );

    let outcome = state
        .billing
        .create_or_update_bill(BillRequest {
            student_id: payload.student_id,
            semester: payload.semester.clone(),
            billed_amount: payload.total_fee,
            due_date: payload.due_date,
            force_update: payload.force_update,
            opening_payment: payload.amount_paid,
        })
        .await
        .map_err(tracked("create_fee"))?;

    let policy = state.config.balance;
    let today = Utc::now().date_naive();

    let response = match outcome {
        BillOutcome::AlreadyBilled(record) => CreateFeeResponse {
            success: true,
            message: "Student already billed for this semester".to_string(),
            created: false,
            already_billed: true,
            warning: Some(format!(
                "Student already has a fee record for {}. Resubmit with force_update to replace it.",
                record.semester
            )),
            previous_amount: None,
            fee_record: FeeRecordResponse::new(record, &policy, today),
            opening_payment: None,
        },
        BillOutcome::Updated {
            record,
            previous_amount,
        } => CreateFeeResponse {
            success: true,
            message: "Fee record updated".to_string(),
            created: false,
            already_billed: false,
            warning: None,
            previous_amount: Some(previous_amount),
            fee_record: FeeRecordResponse::new(record, &policy, today),
            opening_payment: None,
        },
        BillOutcome::Created {
            record,
            opening_payment,
        } => CreateFeeResponse {
            success: true,
            message: "Fee record created".to_string(),
            created: true,
            already_billed: false,
            warning: None,
            previous_amount: None,
            fee_record: FeeRecordResponse::new(record, &policy, today),
            opening_payment,
        },
    };

    Ok(Json(response))
}

/// All fee records, optionally for one semester, joined with the student.
pub async fn list_fees(
    State(state): State<AppState>,
    query: Result<Query<FeeListQuery>, QueryRejection>,
) -> Result<Json<FeeListResponse>, AppError> {
    let Query(query) = query.map_err(AppError::from).map_err(tracked("list_fees"))?;

    let lines = state
        .billing
        .list_fees(query.semester.as_deref())
        .await
        .map_err(tracked("list_fees"))?;

    let fees: Vec<_> = lines.into_iter().map(Into::into).collect();
    Ok(Json(FeeListResponse {
        count: fees.len(),
        fees,
    }))
}

/// Bulk billing and single-bill amendments, selected by `action`.
pub async fn patch_fees(
    State(state): State<AppState>,
    payload: Result<Json<FeeAction>, JsonRejection>,
) -> Result<Json<FeeActionResponse>, AppError> {
    let Json(action) = payload.map_err(AppError::from).map_err(tracked("patch_fees"))?;

    match action {
        FeeAction::BulkBill(data) => {
            data.validate().map_err(AppError::from).map_err(tracked("bulk_bill"))?;

            let semester = data.semester.clone();
            let outcome = state
                .billing
                .bulk_bill(BulkBillRequest {
                    student_ids: data.student_ids,
                    semester: data.semester,
                    billed_amount: data.total_fee,
                    due_date: data.due_date,
                    skip_existing: data.skip_existing,
                })
                .await
                .map_err(tracked("bulk_bill"))?;

            let message = if outcome.processed.is_empty() {
                format!(
                    "No students billed; all {} already billed for {}",
                    outcome.skipped.len(),
                    semester
                )
            } else {
                format!(
                    "Billed {} students for {}; skipped {}",
                    outcome.processed.len(),
                    semester,
                    outcome.skipped.len()
                )
            };

            Ok(Json(FeeActionResponse::BulkBill(BulkBillResponse {
                success: true,
                message,
                processed_count: outcome.processed.len(),
                skipped_count: outcome.skipped.len(),
                already_billed_count: outcome.already_billed.len(),
                processed: outcome.processed,
                skipped: outcome.skipped,
            })))
        }
        FeeAction::UpdateFee(data) => {
            let amendment = state
                .billing
                .update_bill(data.fee_id, data.total_fee, data.due_date)
                .await
                .map_err(tracked("update_fee"))?;

            Ok(Json(FeeActionResponse::UpdateFee(UpdateFeeResponse {
                success: true,
                message: format!("Fee for {} updated", amendment.record.semester),
                old_amount: amendment.previous_amount,
                new_amount: amendment.new_amount,
                fee_record: FeeRecordResponse::new(
                    amendment.record,
                    &state.config.balance,
                    Utc::now().date_naive(),
                ),
            })))
        }
    }
}

/// Administrator-entered payment, confirmed and applied immediately.
pub async fn record_payment(
    State(state): State<AppState>,
    payload: Result<Json<RecordPaymentRequest>, JsonRejection>,
) -> Result<Json<RecordPaymentResponse>, AppError> {
    let Json(payload) = payload.map_err(AppError::from).map_err(tracked("record_payment"))?;
    payload.validate().map_err(AppError::from).map_err(tracked("record_payment"))?;

    let recorded = state
        .payments
        .record_payment(PaymentRequest {
            student_id: payload.student_id,
            semester: payload.semester,
            amount: payload.payment_amount,
            payment_method: payload.payment_method,
            reference_number: payload.reference_number,
            payment_date: payload.payment_date.map(|d| d.into_utc()),
            notes: payload.notes,
        })
        .await
        .map_err(tracked("record_payment"))?;

    let today = Utc::now().date_naive();
    Ok(Json(RecordPaymentResponse {
        success: true,
        message: if recorded.replayed {
            "Payment already recorded".to_string()
        } else {
            "Payment recorded successfully".to_string()
        },
        replayed: recorded.replayed,
        payment: recorded.payment,
        fee_record: recorded
            .fee_record
            .map(|r| FeeRecordResponse::new(r, &state.config.balance, today)),
    }))
}

/// Per-semester and overall balances for one student.
pub async fn student_statement(
    State(state): State<AppState>,
    Path(student_id): Path<Uuid>,
) -> Result<Json<StudentStatementResponse>, AppError> {
    let statement = state
        .billing
        .student_statement(student_id)
        .await
        .map_err(tracked("student_statement"))?;

    Ok(Json(statement.into()))
}
