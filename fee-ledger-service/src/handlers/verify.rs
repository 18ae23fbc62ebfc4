use axum::{extract::rejection::JsonRejection, extract::State, Json};
use service_core::error::AppError;
use validator::Validate;

use super::tracked;
use crate::{
    dtos::{VerifyPaymentRequest, VerifyPaymentResponse},
    startup::AppState,
};

/// Look a payment up by reference, optionally scoped to one student.
pub async fn verify_payment(
    State(state): State<AppState>,
    payload: Result<Json<VerifyPaymentRequest>, JsonRejection>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    let Json(payload) = payload.map_err(AppError::from).map_err(tracked("verify_payment"))?;
    payload
        .validate()
        .map_err(AppError::from)
        .map_err(tracked("verify_payment"))?;

    let verification = state
        .payments
        .verify_payment(
            &payload.reference_number,
            payload.registration_number.as_deref(),
        )
        .await
        .map_err(tracked("verify_payment"))?;

    let message = if verification.found {
        "Payment found"
    } else {
        "No payment found for this reference"
    };

    Ok(Json(VerifyPaymentResponse {
        found: verification.found,
        message: message.to_string(),
        student_name: verification.student.as_ref().map(|s| s.name.clone()),
        registration_number: verification
            .student
            .as_ref()
            .map(|s| s.registration_number.clone()),
        payment: verification.payment,
    }))
}
