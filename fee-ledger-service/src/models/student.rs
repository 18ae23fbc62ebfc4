//! Student identity as seen by the ledger.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Registered student. Owned by registration; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Student {
    pub student_id: Uuid,
    pub registration_number: String,
    pub name: String,
    pub course: String,
    pub year_of_study: i32,
}
