//! PostgreSQL ledger store for fee-ledger-service.

use crate::models::money::max_amount;
use crate::models::{
    BillWrite, BulkBill, FeeRecord, NewPayment, PaymentInsert, PaymentRecord, PaymentStatus,
    StatusChange, Student, UpsertBill,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{semester_not_billed, LedgerStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const FEE_COLUMNS: &str =
    "fee_id, student_id, semester, billed_amount, paid_amount, due_date, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, student_id, semester, amount, payment_method, \
     reference_number, payment_date, status, notes, created_utc, updated_utc";

/// Row shape of `payment_records`; status is stored as text.
#[derive(Debug, FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    student_id: Uuid,
    semester: Option<String>,
    amount: Decimal,
    payment_method: String,
    reference_number: String,
    payment_date: DateTime<Utc>,
    status: String,
    notes: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::parse(&row.status).ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Payment {} has unknown status '{}'",
                row.payment_id,
                row.status
            ))
        })?;

        Ok(PaymentRecord {
            payment_id: row.payment_id,
            student_id: row.student_id,
            semester: row.semester,
            amount: row.amount,
            payment_method: row.payment_method,
            reference_number: row.reference_number,
            payment_date: row.payment_date,
            status,
            notes: row.notes,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

fn payments_from_rows(rows: Vec<PaymentRow>) -> Result<Vec<PaymentRecord>, AppError> {
    rows.into_iter().map(PaymentRecord::try_from).collect()
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Like [`db_error`], but a `paid_amount` that no longer fits its column
/// (SQLSTATE 22003) is reported as a bad amount.
fn paid_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| match &e {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("22003") => {
            AppError::BadRequest(anyhow::anyhow!("Paid total would exceed {}", max_amount()))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e)),
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fee-ledger-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))
    }

    async fn payment_by_reference_in(
        tx: &mut Transaction<'_, Postgres>,
        reference_number: &str,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE reference_number = $1"
        ))
        .bind(reference_number)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("Failed to look up reference"))?;

        row.map(PaymentRecord::try_from).transpose()
    }

    /// `None` when the reference number is already taken.
    async fn insert_payment_row(
        tx: &mut Transaction<'_, Postgres>,
        payment: &NewPayment,
        semester: Option<&str>,
    ) -> Result<Option<PaymentRow>, AppError> {
        let inserted = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payment_records (
                payment_id, student_id, semester, amount, payment_method, reference_number,
                payment_date, status, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(payment.student_id)
        .bind(semester)
        .bind(payment.amount)
        .bind(&payment.payment_method)
        .bind(&payment.reference_number)
        .bind(payment.payment_date)
        .bind(payment.status.as_str())
        .bind(&payment.notes)
        .fetch_one(&mut **tx)
        .await;

        match inserted {
            Ok(row) => Ok(Some(row)),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => Ok(None),
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert payment: {}",
                e
            ))),
        }
    }

    /// Add `amount` to the paid total of the named semester's record, or of
    /// the most recent record when no semester is given. Single statement;
    /// the row lock it takes is held until commit.
    async fn reconcile_in(
        tx: &mut Transaction<'_, Postgres>,
        student_id: Uuid,
        semester: Option<&str>,
        amount: Decimal,
    ) -> Result<Option<FeeRecord>, AppError> {
        sqlx::query_as::<_, FeeRecord>(&format!(
            r#"
            UPDATE fee_records
            SET paid_amount = paid_amount + $2, updated_utc = NOW()
            WHERE fee_id = (
                SELECT fee_id FROM fee_records
                WHERE student_id = $1 AND ($3::varchar IS NULL OR semester = $3)
                ORDER BY created_utc DESC
                LIMIT 1
            )
            RETURNING {FEE_COLUMNS}
            "#
        ))
        .bind(student_id)
        .bind(amount)
        .bind(semester)
        .fetch_optional(&mut **tx)
        .await
        .map_err(paid_error("Failed to reconcile payment"))
    }
}

#[async_trait]
impl LedgerStore for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Student Operations
    // =========================================================================

    #[instrument(skip(self, student), fields(student_id = %student.student_id))]
    async fn insert_student(&self, student: &Student) -> Result<Student, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_student"])
            .start_timer();

        let result = sqlx::query_as::<_, Student>(
            r#"
            INSERT INTO students (student_id, registration_number, name, course, year_of_study)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_id) DO UPDATE
            SET name = EXCLUDED.name, course = EXCLUDED.course, year_of_study = EXCLUDED.year_of_study
            RETURNING student_id, registration_number, name, course, year_of_study
            "#,
        )
        .bind(student.student_id)
        .bind(&student.registration_number)
        .bind(&student.name)
        .bind(&student.course)
        .bind(student.year_of_study)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();

        match result {
            Ok(student) => Ok(student),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(anyhow::anyhow!(
                    "Registration number {} already exists",
                    student.registration_number
                )))
            }
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert student: {}",
                e
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn get_student(&self, student_id: Uuid) -> Result<Option<Student>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_student"])
            .start_timer();

        let student = sqlx::query_as::<_, Student>(
            r#"
            SELECT student_id, registration_number, name, course, year_of_study
            FROM students
            WHERE student_id = $1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get student"))?;

        timer.observe_duration();
        Ok(student)
    }

    #[instrument(skip(self, student_ids), fields(count = student_ids.len()))]
    async fn get_students(&self, student_ids: &[Uuid]) -> Result<Vec<Student>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_students"])
            .start_timer();

        let students = sqlx::query_as::<_, Student>(
            r#"
            SELECT student_id, registration_number, name, course, year_of_study
            FROM students
            WHERE student_id = ANY($1)
            "#,
        )
        .bind(student_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to get students"))?;

        timer.observe_duration();
        Ok(students)
    }

    #[instrument(skip(self))]
    async fn list_students(&self) -> Result<Vec<Student>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_students"])
            .start_timer();

        let students = sqlx::query_as::<_, Student>(
            r#"
            SELECT student_id, registration_number, name, course, year_of_study
            FROM students
            ORDER BY registration_number
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list students"))?;

        timer.observe_duration();
        Ok(students)
    }

    // =========================================================================
    // Fee Record Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_fee_record(&self, fee_id: Uuid) -> Result<Option<FeeRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_fee_record"])
            .start_timer();

        let record = sqlx::query_as::<_, FeeRecord>(&format!(
            "SELECT {FEE_COLUMNS} FROM fee_records WHERE fee_id = $1"
        ))
        .bind(fee_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get fee record"))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn find_fee_record(
        &self,
        student_id: Uuid,
        semester: &str,
    ) -> Result<Option<FeeRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_fee_record"])
            .start_timer();

        let record = sqlx::query_as::<_, FeeRecord>(&format!(
            "SELECT {FEE_COLUMNS} FROM fee_records WHERE student_id = $1 AND semester = $2"
        ))
        .bind(student_id)
        .bind(semester)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find fee record"))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn list_fee_records(&self, semester: Option<&str>) -> Result<Vec<FeeRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_fee_records"])
            .start_timer();

        let records = sqlx::query_as::<_, FeeRecord>(&format!(
            r#"
            SELECT {FEE_COLUMNS}
            FROM fee_records
            WHERE ($1::varchar IS NULL OR semester = $1)
            ORDER BY created_utc
            "#
        ))
        .bind(semester)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list fee records"))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn list_student_fee_records(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<FeeRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_student_fee_records"])
            .start_timer();

        let records = sqlx::query_as::<_, FeeRecord>(&format!(
            "SELECT {FEE_COLUMNS} FROM fee_records WHERE student_id = $1 ORDER BY created_utc"
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list student fee records"))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self, student_ids), fields(count = student_ids.len()))]
    async fn billed_student_ids(
        &self,
        semester: &str,
        student_ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["billed_student_ids"])
            .start_timer();

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT student_id
            FROM fee_records
            WHERE semester = $1 AND student_id = ANY($2)
            "#,
        )
        .bind(semester)
        .bind(student_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to check existing bills"))?;

        timer.observe_duration();
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self, bill, opening), fields(student_id = %bill.student_id, semester = %bill.semester))]
    async fn write_bill(
        &self,
        bill: &UpsertBill,
        replace: bool,
        opening: Option<&NewPayment>,
    ) -> Result<BillWrite, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["write_bill"])
            .start_timer();

        let mut tx = self.begin().await?;

        // DO NOTHING waits for a concurrent insert of the same key, so no
        // row back means the bill already exists.
        let inserted = sqlx::query_as::<_, FeeRecord>(&format!(
            r#"
            INSERT INTO fee_records (fee_id, student_id, semester, billed_amount, paid_amount, due_date)
            VALUES ($1, $2, $3, $4, 0, $5)
            ON CONFLICT (student_id, semester) DO NOTHING
            RETURNING {FEE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(bill.student_id)
        .bind(&bill.semester)
        .bind(bill.billed_amount)
        .bind(bill.due_date)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to insert fee record"))?;

        let outcome = match inserted {
            Some(record) => {
                let Some(opening) = opening else {
                    tx.commit()
                        .await
                        .map_err(db_error("Failed to commit fee record"))?;
                    timer.observe_duration();
                    return Ok(BillWrite::Created {
                        record,
                        opening_payment: None,
                    });
                };

                let Some(row) =
                    Self::insert_payment_row(&mut tx, opening, Some(record.semester.as_str())).await?
                else {
                    tx.rollback().await.ok();
                    timer.observe_duration();
                    return Ok(BillWrite::OpeningReferenceTaken);
                };

                let record = sqlx::query_as::<_, FeeRecord>(&format!(
                    r#"
                    UPDATE fee_records
                    SET paid_amount = paid_amount + $2, updated_utc = NOW()
                    WHERE fee_id = $1
                    RETURNING {FEE_COLUMNS}
                    "#
                ))
                .bind(record.fee_id)
                .bind(opening.amount)
                .fetch_one(&mut *tx)
                .await
                .map_err(paid_error("Failed to apply opening payment"))?;

                BillWrite::Created {
                    record,
                    opening_payment: Some(PaymentRecord::try_from(row)?),
                }
            }
            None if !replace => {
                let existing = sqlx::query_as::<_, FeeRecord>(&format!(
                    "SELECT {FEE_COLUMNS} FROM fee_records WHERE student_id = $1 AND semester = $2"
                ))
                .bind(bill.student_id)
                .bind(&bill.semester)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Failed to read existing fee record"))?;

                BillWrite::Unchanged(existing)
            }
            None => {
                let previous_amount: Decimal = sqlx::query_scalar(
                    "SELECT billed_amount FROM fee_records WHERE student_id = $1 AND semester = $2 FOR UPDATE",
                )
                .bind(bill.student_id)
                .bind(&bill.semester)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Failed to lock fee record"))?;

                // paid_amount is only ever set on insert.
                let record = sqlx::query_as::<_, FeeRecord>(&format!(
                    r#"
                    UPDATE fee_records
                    SET billed_amount = $3, due_date = COALESCE($4, due_date), updated_utc = NOW()
                    WHERE student_id = $1 AND semester = $2
                    RETURNING {FEE_COLUMNS}
                    "#
                ))
                .bind(bill.student_id)
                .bind(&bill.semester)
                .bind(bill.billed_amount)
                .bind(bill.due_date)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Failed to re-bill fee record"))?;

                BillWrite::Replaced {
                    record,
                    previous_amount,
                }
            }
        };

        tx.commit()
            .await
            .map_err(db_error("Failed to commit fee record"))?;

        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self, bill), fields(semester = %bill.semester, count = bill.student_ids.len()))]
    async fn bulk_upsert_fee_records(&self, bill: &BulkBill) -> Result<Vec<FeeRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["bulk_upsert_fee_records"])
            .start_timer();

        let fee_ids: Vec<Uuid> = bill.student_ids.iter().map(|_| Uuid::new_v4()).collect();

        // paid_amount is only ever set on insert.
        let records = sqlx::query_as::<_, FeeRecord>(&format!(
            r#"
            INSERT INTO fee_records (fee_id, student_id, semester, billed_amount, paid_amount, due_date)
            SELECT batch.fee_id, batch.student_id, $3, $4, 0, $5
            FROM UNNEST($1::uuid[], $2::uuid[]) AS batch(fee_id, student_id)
            ON CONFLICT (student_id, semester) DO UPDATE
            SET billed_amount = EXCLUDED.billed_amount,
                due_date = COALESCE(EXCLUDED.due_date, fee_records.due_date),
                updated_utc = NOW()
            RETURNING {FEE_COLUMNS}
            "#
        ))
        .bind(&fee_ids)
        .bind(&bill.student_ids)
        .bind(&bill.semester)
        .bind(bill.billed_amount)
        .bind(bill.due_date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to bulk upsert fee records"))?;

        timer.observe_duration();
        info!(rows = records.len(), "Bulk billing batch written");
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn update_fee_record(
        &self,
        fee_id: Uuid,
        billed_amount: Decimal,
        due_date: Option<NaiveDate>,
    ) -> Result<Option<(Decimal, FeeRecord)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_fee_record"])
            .start_timer();

        let mut tx = self.begin().await?;

        let previous: Option<Decimal> =
            sqlx::query_scalar("SELECT billed_amount FROM fee_records WHERE fee_id = $1 FOR UPDATE")
                .bind(fee_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("Failed to lock fee record"))?;

        let Some(previous) = previous else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let record = sqlx::query_as::<_, FeeRecord>(&format!(
            r#"
            UPDATE fee_records
            SET billed_amount = $2, due_date = COALESCE($3, due_date), updated_utc = NOW()
            WHERE fee_id = $1
            RETURNING {FEE_COLUMNS}
            "#
        ))
        .bind(fee_id)
        .bind(billed_amount)
        .bind(due_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to update fee record"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit fee update"))?;

        timer.observe_duration();
        Ok(Some((previous, record)))
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<PaymentRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get payment"))?;

        timer.observe_duration();
        row.map(PaymentRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_payment_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_payment_by_reference"])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE reference_number = $1"
        ))
        .bind(reference_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find payment by reference"))?;

        timer.observe_duration();
        row.map(PaymentRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_payments(&self) -> Result<Vec<PaymentRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records ORDER BY created_utc"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list payments"))?;

        timer.observe_duration();
        payments_from_rows(rows)
    }

    #[instrument(skip(self))]
    async fn list_student_payments(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_student_payments"])
            .start_timer();

        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE student_id = $1 ORDER BY created_utc"
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list student payments"))?;

        timer.observe_duration();
        payments_from_rows(rows)
    }

    #[instrument(skip(self, payment), fields(student_id = %payment.student_id, reference = %payment.reference_number))]
    async fn insert_payment(&self, payment: &NewPayment) -> Result<PaymentInsert, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let mut tx = self.begin().await?;

        if let Some(existing) = Self::payment_by_reference_in(&mut tx, &payment.reference_number).await? {
            tx.rollback().await.ok();
            return Ok(PaymentInsert::DuplicateReference(existing));
        }

        let fee_record = if payment.status == PaymentStatus::Confirmed {
            let reconciled = Self::reconcile_in(
                &mut tx,
                payment.student_id,
                payment.semester.as_deref(),
                payment.amount,
            )
            .await?;

            match reconciled {
                Some(record) => Some(record),
                None => {
                    tx.rollback().await.ok();
                    timer.observe_duration();
                    return Ok(PaymentInsert::FeeRecordMissing);
                }
            }
        } else {
            None
        };

        let semester = payment
            .semester
            .clone()
            .or_else(|| fee_record.as_ref().map(|r| r.semester.clone()));

        let Some(row) = Self::insert_payment_row(&mut tx, payment, semester.as_deref()).await? else {
            // Another request took the reference between our check and insert.
            tx.rollback().await.ok();
            timer.observe_duration();
            return match self.find_payment_by_reference(&payment.reference_number).await? {
                Some(existing) => Ok(PaymentInsert::DuplicateReference(existing)),
                None => Err(AppError::Conflict(anyhow::anyhow!(
                    "Reference number {} is already in use",
                    payment.reference_number
                ))),
            };
        };

        tx.commit()
            .await
            .map_err(db_error("Failed to commit payment"))?;

        timer.observe_duration();

        Ok(PaymentInsert::Inserted {
            payment: PaymentRecord::try_from(row)?,
            fee_record,
        })
    }

    #[instrument(skip(self, notes))]
    async fn transition_payment(
        &self,
        payment_id: Uuid,
        expected: PaymentStatus,
        status: PaymentStatus,
        notes: Option<&str>,
    ) -> Result<Option<StatusChange>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_payment"])
            .start_timer();

        let mut tx = self.begin().await?;

        // The status guard makes a second confirmation match zero rows.
        let updated = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payment_records
            SET status = $3, notes = COALESCE($4, notes), updated_utc = NOW()
            WHERE payment_id = $1 AND status = $2
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(notes)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to update payment status"))?;

        let Some(mut row) = updated else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        let mut fee_record = None;
        if expected.reconciles_on(status) {
            fee_record =
                Self::reconcile_in(&mut tx, row.student_id, row.semester.as_deref(), row.amount)
                    .await?;

            match fee_record.as_ref() {
                // Only a payment submitted without a semester is linked to
                // the one it was applied to.
                Some(record) if row.semester.is_none() => {
                    sqlx::query("UPDATE payment_records SET semester = $2 WHERE payment_id = $1")
                        .bind(payment_id)
                        .bind(&record.semester)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_error("Failed to link payment to semester"))?;
                    row.semester = Some(record.semester.clone());
                }
                Some(_) => {}
                None => match row.semester.as_deref() {
                    Some(semester) => {
                        tx.rollback().await.ok();
                        timer.observe_duration();
                        return Err(semester_not_billed(semester));
                    }
                    None => warn!(
                        student_id = %row.student_id,
                        "Confirmed payment has no fee record to reconcile against"
                    ),
                },
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit status change"))?;

        timer.observe_duration();

        Ok(Some(StatusChange {
            payment: PaymentRecord::try_from(row)?,
            previous: expected,
            fee_record,
        }))
    }
}
