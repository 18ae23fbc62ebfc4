//! Domain models for fee-ledger-service.

mod fee_record;
pub mod money;
mod payment;
mod student;

pub use fee_record::{BillWrite, BulkBill, FeeRecord, UpsertBill};
pub use payment::{NewPayment, PaymentInsert, PaymentRecord, PaymentStatus, StatusChange};
pub use student::Student;
