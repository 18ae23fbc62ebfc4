//! `/finance` endpoints: dashboard, payment listing and approval.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

use super::tracked;
use crate::{
    dtos::{
        DashboardQuery, FeeRecordResponse, PaymentListQuery, SubmitPaymentRequest,
        SubmitPaymentResponse, UpdatePaymentStatusRequest, UpdatePaymentStatusResponse,
    },
    models::PaymentStatus,
    services::{
        reporting::{Dashboard, PaymentPage},
        PaymentSubmission, ReportPeriod,
    },
    startup::AppState,
};

/// Finance dashboard for `period` (default `current_month`).
pub async fn dashboard(
    State(state): State<AppState>,
    query: Result<Query<DashboardQuery>, QueryRejection>,
) -> Result<Json<Dashboard>, AppError> {
    let Query(query) = query.map_err(AppError::from).map_err(tracked("dashboard"))?;

    let requested = query.period.as_deref().unwrap_or("");
    let period = ReportPeriod::parse(requested).ok_or_else(|| {
        tracked("dashboard")(AppError::BadRequest(anyhow::anyhow!(
            "Invalid period '{}'. Must be one of: current_month, last_month, current_year, last_year",
            requested
        )))
    })?;

    let dashboard = state
        .reports
        .dashboard(period, Utc::now().date_naive())
        .await
        .map_err(tracked("dashboard"))?;

    Ok(Json(dashboard))
}

/// Filtered, paginated payments with summary statistics.
pub async fn list_payments(
    State(state): State<AppState>,
    query: Result<Query<PaymentListQuery>, QueryRejection>,
) -> Result<Json<PaymentPage>, AppError> {
    let Query(query) = query.map_err(AppError::from).map_err(tracked("list_payments"))?;
    let filter = query.filter().map_err(tracked("list_payments"))?;

    let page = state
        .reports
        .payments(&filter, query.page(), query.limit())
        .await
        .map_err(tracked("list_payments"))?;

    Ok(Json(page))
}

/// Student-reported payment, held as pending.
pub async fn submit_payment(
    State(state): State<AppState>,
    payload: Result<Json<SubmitPaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitPaymentResponse>), AppError> {
    let Json(payload) = payload.map_err(AppError::from).map_err(tracked("submit_payment"))?;

    let recorded = state
        .payments
        .submit_payment(PaymentSubmission {
            student_id: payload.student_id,
            semester: payload.semester,
            amount: payload.amount,
            payment_method: payload.payment_method,
            reference_number: payload.reference_number,
            payment_date: payload.payment_date.map(|d| d.into_utc()),
            notes: payload.notes,
        })
        .await
        .map_err(tracked("submit_payment"))?;

    let status = if recorded.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(SubmitPaymentResponse {
            success: true,
            message: "Payment submitted for verification".to_string(),
            replayed: recorded.replayed,
            payment: recorded.payment,
        }),
    ))
}

/// Approve or reject a payment.
pub async fn update_payment_status(
    State(state): State<AppState>,
    payload: Result<Json<UpdatePaymentStatusRequest>, JsonRejection>,
) -> Result<Json<UpdatePaymentStatusResponse>, AppError> {
    let Json(payload) = payload
        .map_err(AppError::from)
        .map_err(tracked("update_payment_status"))?;
    payload
        .validate()
        .map_err(AppError::from)
        .map_err(tracked("update_payment_status"))?;

    let update = state
        .payments
        .update_payment_status(payload.payment_id, &payload.status, payload.notes)
        .await
        .map_err(tracked("update_payment_status"))?;

    let message = match (update.changed(), update.payment.status) {
        (false, status) => format!("Payment already {}", status),
        (true, PaymentStatus::Confirmed) => "Payment confirmed".to_string(),
        (true, PaymentStatus::Rejected) => "Payment rejected".to_string(),
        (true, PaymentStatus::Pending) => "Payment returned to pending".to_string(),
    };

    let today = Utc::now().date_naive();
    Ok(Json(UpdatePaymentStatusResponse {
        success: true,
        message,
        previous_status: update.previous,
        fee_record: update
            .fee_record
            .map(|r| FeeRecordResponse::new(r, &state.config.balance, today)),
        payment: update.payment,
    }))
}
