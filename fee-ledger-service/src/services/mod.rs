//! Services module for fee-ledger-service.

pub mod balance;
pub mod billing;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod payments;
pub mod reporting;
pub mod store;

pub use balance::{BalancePolicy, BalanceView, FeeStatus};
pub use billing::{
    BillAmendment, BillOutcome, BillRequest, BillingManager, BulkBillOutcome, BulkBillRequest,
    FeeLine, StudentStatement,
};
pub use database::Database;
pub use memory::MemoryLedgerStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use notifier::{
    HttpDispatcher, LogDispatcher, Notice, NoticeCategory, NotificationDispatcher, Notifier,
    NotifyError,
};
pub use payments::{
    PaymentRecorder, PaymentRequest, PaymentSubmission, RecordedPayment, StatusUpdate,
    Verification,
};
pub use reporting::{PaymentFilter, ReportPeriod, ReportingAggregator};
pub use store::{LedgerSnapshot, LedgerStore};
