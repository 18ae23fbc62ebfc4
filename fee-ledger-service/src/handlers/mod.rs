//! HTTP handlers for fee-ledger-service.

pub mod fees;
pub mod finance;
pub mod verify;

use crate::services::record_error;
use service_core::error::AppError;

fn error_kind(error: &AppError) -> &'static str {
    match error {
        AppError::ValidationError(_) | AppError::BadRequest(_) => "invalid_argument",
        AppError::NotFound(_) => "not_found",
        AppError::Conflict(_) => "conflict",
        AppError::DatabaseError(_) => "store_failure",
        AppError::ServiceUnavailable => "unavailable",
        AppError::InternalError(_) | AppError::ConfigError(_) => "internal",
    }
}

/// Count the error against `operation` and pass it through.
pub(crate) fn tracked(operation: &'static str) -> impl Fn(AppError) -> AppError {
    move |error| {
        record_error(error_kind(&error), operation);
        error
    }
}
