use super::{DateInput, FeeRecordResponse};
use crate::models::{PaymentRecord, PaymentStatus};
use crate::services::PaymentFilter;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// `GET /finance/dashboard`
#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub period: Option<String>,
}

/// `GET /finance/payments`. Parameter names follow the finance UI.
#[derive(Debug, Default, Deserialize)]
pub struct PaymentListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "paymentMethod", alias = "payment_method")]
    pub payment_method: Option<String>,
    #[serde(rename = "startDate", alias = "start_date")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate", alias = "end_date")]
    pub end_date: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date(name: &str, value: &Option<String>) -> Result<Option<NaiveDate>, AppError> {
    non_blank(value)
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|_| {
                AppError::BadRequest(anyhow::anyhow!("{} must be a date (YYYY-MM-DD)", name))
            })
        })
        .transpose()
}

impl PaymentListQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    /// Blank parameters mean "no filter"; `status=all` likewise.
    pub fn filter(&self) -> Result<PaymentFilter, AppError> {
        let status = match non_blank(&self.status) {
            None | Some("all") => None,
            Some(s) => Some(PaymentStatus::parse(s).ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Invalid status '{}'. Must be one of: confirmed, pending, rejected",
                    s
                ))
            })?),
        };
        let payment_method = match non_blank(&self.payment_method) {
            None | Some("all") => None,
            Some(m) => Some(m.to_string()),
        };

        Ok(PaymentFilter {
            search: non_blank(&self.search).map(str::to_string),
            status,
            payment_method,
            start_date: parse_date("startDate", &self.start_date)?,
            end_date: parse_date("endDate", &self.end_date)?,
        })
    }
}

/// `PATCH /finance/payments`
#[derive(Debug, Deserialize, Validate)]
pub struct UpdatePaymentStatusRequest {
    pub payment_id: Uuid,
    #[validate(length(min = 1, message = "status is required"))]
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdatePaymentStatusResponse {
    pub success: bool,
    pub message: String,
    pub previous_status: PaymentStatus,
    pub payment: PaymentRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_record: Option<FeeRecordResponse>,
}

/// `POST /finance/payments`: a payment reported by the student, held as
/// pending until finance confirms it.
#[derive(Debug, Deserialize)]
pub struct SubmitPaymentRequest {
    pub student_id: Uuid,
    #[serde(default)]
    pub semester: Option<String>,
    #[serde(alias = "payment_amount")]
    pub amount: Decimal,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub payment_date: Option<DateInput>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitPaymentResponse {
    pub success: bool,
    pub message: String,
    pub replayed: bool,
    pub payment: PaymentRecord,
}

/// `POST /verify-payment`
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyPaymentRequest {
    #[serde(default)]
    #[validate(length(min = 1, message = "reference_number is required"))]
    pub reference_number: String,
    #[serde(default)]
    pub registration_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub found: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_number: Option<String>,
}
