use super::{default_true, DateInput};
use crate::models::{FeeRecord, PaymentRecord, Student};
use crate::services::{BalancePolicy, BalanceView, FeeLine, StudentStatement};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// Requests
// ============================================================================

/// `POST /fees`
#[derive(Debug, Deserialize, Validate)]
pub struct CreateFeeRequest {
    pub student_id: Uuid,
    #[validate(length(min = 1, message = "semester is required"))]
    pub semester: String,
    #[serde(alias = "total_billed")]
    pub total_fee: Decimal,
    #[serde(default, alias = "total_paid")]
    pub amount_paid: Option<Decimal>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub force_update: bool,
}

/// `GET /fees`
#[derive(Debug, Deserialize)]
pub struct FeeListQuery {
    pub semester: Option<String>,
}

/// `PATCH /fees`: one body shape per action.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum FeeAction {
    BulkBill(BulkBillData),
    UpdateFee(UpdateFeeData),
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkBillData {
    #[validate(length(min = 1, message = "student_ids must be a non-empty list"))]
    pub student_ids: Vec<Uuid>,
    #[validate(length(min = 1, message = "semester is required"))]
    pub semester: String,
    #[serde(alias = "total_billed")]
    pub total_fee: Decimal,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFeeData {
    pub fee_id: Uuid,
    #[serde(alias = "total_billed")]
    pub total_fee: Decimal,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

/// `PUT /fees`: administrator-entered payment.
#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    pub student_id: Uuid,
    #[validate(length(min = 1, message = "semester is required"))]
    pub semester: String,
    #[serde(alias = "amount")]
    pub payment_amount: Decimal,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub payment_date: Option<DateInput>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Fee record with its derived figures.
#[derive(Debug, Serialize)]
pub struct FeeRecordResponse {
    #[serde(flatten)]
    pub record: FeeRecord,
    pub summary: BalanceView,
}

impl FeeRecordResponse {
    pub fn new(record: FeeRecord, policy: &BalancePolicy, today: NaiveDate) -> Self {
        let summary = policy.record_view(&record, today);
        Self { record, summary }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateFeeResponse {
    pub success: bool,
    pub message: String,
    pub created: bool,
    pub already_billed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_amount: Option<Decimal>,
    pub fee_record: FeeRecordResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening_payment: Option<PaymentRecord>,
}

#[derive(Debug, Serialize)]
pub struct FeeListItem {
    #[serde(flatten)]
    pub record: FeeRecord,
    pub student_name: Option<String>,
    pub registration_number: Option<String>,
    pub course: Option<String>,
    pub year_of_study: Option<i32>,
    pub summary: BalanceView,
}

impl From<FeeLine> for FeeListItem {
    fn from(line: FeeLine) -> Self {
        let student = line.student;
        Self {
            student_name: student.as_ref().map(|s| s.name.clone()),
            registration_number: student.as_ref().map(|s| s.registration_number.clone()),
            course: student.as_ref().map(|s| s.course.clone()),
            year_of_study: student.as_ref().map(|s| s.year_of_study),
            record: line.record,
            summary: line.view,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeeListResponse {
    pub count: usize,
    pub fees: Vec<FeeListItem>,
}

#[derive(Debug, Serialize)]
pub struct BulkBillResponse {
    pub success: bool,
    pub message: String,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub already_billed_count: usize,
    pub processed: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct UpdateFeeResponse {
    pub success: bool,
    pub message: String,
    pub old_amount: Decimal,
    pub new_amount: Decimal,
    pub fee_record: FeeRecordResponse,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FeeActionResponse {
    BulkBill(BulkBillResponse),
    UpdateFee(UpdateFeeResponse),
}

#[derive(Debug, Serialize)]
pub struct RecordPaymentResponse {
    pub success: bool,
    pub message: String,
    pub replayed: bool,
    pub payment: PaymentRecord,
    pub fee_record: Option<FeeRecordResponse>,
}

#[derive(Debug, Serialize)]
pub struct StudentStatementResponse {
    pub student: Student,
    pub semesters: Vec<FeeRecordResponse>,
    pub payments: Vec<PaymentRecord>,
    pub summary: BalanceView,
}

impl From<StudentStatement> for StudentStatementResponse {
    fn from(statement: StudentStatement) -> Self {
        Self {
            student: statement.student,
            semesters: statement
                .semesters
                .into_iter()
                .map(|(record, summary)| FeeRecordResponse { record, summary })
                .collect(),
            payments: statement.payments,
            summary: statement.overall,
        }
    }
}
