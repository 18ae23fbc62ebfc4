//! PostgreSQL ledger store tests.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p fee-ledger-service -- --ignored

mod common;

use chrono::{NaiveDate, Utc};
use common::{amount, test_database, SEMESTER};
use fee_ledger_service::models::money::max_amount;
use fee_ledger_service::models::{
    BillWrite, BulkBill, NewPayment, PaymentInsert, PaymentStatus, Student, UpsertBill,
};
use fee_ledger_service::services::{Database, LedgerStore};
use futures::future::join_all;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

async fn seed_student(db: &Database, registration_number: &str) -> Uuid {
    db.insert_student(&Student {
        student_id: Uuid::new_v4(),
        registration_number: registration_number.to_string(),
        name: format!("Student {}", registration_number),
        course: "BCom".to_string(),
        year_of_study: 1,
    })
    .await
    .expect("Failed to seed student")
    .student_id
}

fn bill(student_id: Uuid, billed: i64) -> UpsertBill {
    UpsertBill {
        student_id,
        semester: SEMESTER.to_string(),
        billed_amount: amount(billed),
        due_date: None,
    }
}

fn payment(student_id: Uuid, paid: i64, reference: &str, status: PaymentStatus) -> NewPayment {
    NewPayment {
        student_id,
        semester: Some(SEMESTER.to_string()),
        amount: amount(paid),
        payment_method: "mpesa".to_string(),
        reference_number: reference.to_string(),
        payment_date: Utc::now(),
        status,
        notes: None,
    }
}

async fn billed(db: &Database, registration_number: &str, billed: i64) -> Uuid {
    let student_id = seed_student(db, registration_number).await;
    db.write_bill(&bill(student_id, billed), false, None)
        .await
        .expect("Failed to bill student");
    student_id
}

#[tokio::test]
#[ignore]
async fn migrations_are_repeatable_and_enforce_the_schema() {
    let db = test_database().await;
    db.run_migrations().await.expect("Second migration run failed");
    db.health_check().await.expect("Health check failed");

    let student_id = billed(&db, "REG-001", 50_000).await;

    let duplicate = db
        .insert_student(&Student {
            student_id: Uuid::new_v4(),
            registration_number: "REG-001".to_string(),
            name: "Someone Else".to_string(),
            course: "BCom".to_string(),
            year_of_study: 2,
        })
        .await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));

    let zero = NewPayment {
        amount: Decimal::ZERO,
        ..payment(student_id, 0, "ZERO-1", PaymentStatus::Pending)
    };
    assert!(db.insert_payment(&zero).await.is_err());
    assert!(db.list_payments().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn rebill_keeps_paid_amount_and_due_date() {
    let db = test_database().await;
    let student_id = seed_student(&db, "REG-001").await;
    let due = NaiveDate::from_ymd_opt(2025, 2, 28).unwrap();
    let first = UpsertBill {
        due_date: Some(due),
        ..bill(student_id, 50_000)
    };
    let created = db.write_bill(&first, false, None).await.unwrap();
    assert!(matches!(created, BillWrite::Created { .. }));
    db.insert_payment(&payment(student_id, 20_000, "R1", PaymentStatus::Confirmed))
        .await
        .unwrap();

    let unchanged = db.write_bill(&bill(student_id, 70_000), false, None).await.unwrap();
    match unchanged {
        BillWrite::Unchanged(record) => assert_eq!(record.billed_amount, amount(50_000)),
        other => panic!("expected Unchanged, got {:?}", other),
    }

    let replaced = db.write_bill(&bill(student_id, 60_000), true, None).await.unwrap();
    match replaced {
        BillWrite::Replaced {
            record,
            previous_amount,
        } => {
            assert_eq!(previous_amount, amount(50_000));
            assert_eq!(record.billed_amount, amount(60_000));
            assert_eq!(record.paid_amount, amount(20_000));
            assert_eq!(record.due_date, Some(due));
        }
        other => panic!("expected Replaced, got {:?}", other),
    }
}

#[tokio::test]
#[ignore]
async fn concurrent_first_bills_create_exactly_one_row() {
    let db = Arc::new(test_database().await);
    let student_id = seed_student(&db, "REG-001").await;

    let openings: Vec<NewPayment> = (0..2)
        .map(|i| payment(student_id, 1_000, &format!("OPEN-{}", i), PaymentStatus::Confirmed))
        .collect();
    let bills = [bill(student_id, 50_000), bill(student_id, 99_000)];
    let outcomes = join_all(
        bills
            .iter()
            .zip(&openings)
            .map(|(bill, opening)| db.write_bill(bill, false, Some(opening))),
    )
    .await;

    let created: Vec<Decimal> = outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .filter_map(|outcome| match outcome {
            BillWrite::Created { record, .. } => Some(record.billed_amount),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 1);

    let record = db.find_fee_record(student_id, SEMESTER).await.unwrap().unwrap();
    assert_eq!(record.billed_amount, created[0]);
    assert_eq!(record.paid_amount, amount(1_000));
    assert_eq!(db.list_student_payments(student_id).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn opening_payment_with_taken_reference_rolls_back_the_bill() {
    let db = test_database().await;
    let first = billed(&db, "REG-001", 10_000).await;
    db.insert_payment(&payment(first, 100, "ADM-1", PaymentStatus::Confirmed))
        .await
        .unwrap();
    let second = seed_student(&db, "REG-002").await;

    let outcome = db
        .write_bill(
            &bill(second, 10_000),
            false,
            Some(&payment(second, 500, "ADM-1", PaymentStatus::Confirmed)),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, BillWrite::OpeningReferenceTaken));
    assert!(db.find_fee_record(second, SEMESTER).await.unwrap().is_none());
    assert!(db.list_student_payments(second).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn bulk_rebill_keeps_paid_amounts() {
    let db = test_database().await;
    let x = billed(&db, "REG-001", 40_000).await;
    let y = seed_student(&db, "REG-002").await;
    db.insert_payment(&payment(x, 15_000, "R-X", PaymentStatus::Confirmed))
        .await
        .unwrap();

    let records = db
        .bulk_upsert_fee_records(&BulkBill {
            student_ids: vec![x, y],
            semester: SEMESTER.to_string(),
            billed_amount: amount(50_000),
            due_date: None,
        })
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    let x_record = db.find_fee_record(x, SEMESTER).await.unwrap().unwrap();
    assert_eq!(x_record.billed_amount, amount(50_000));
    assert_eq!(x_record.paid_amount, amount(15_000));
    let y_record = db.find_fee_record(y, SEMESTER).await.unwrap().unwrap();
    assert_eq!(y_record.paid_amount, amount(0));
}

#[tokio::test]
#[ignore]
async fn confirmation_applies_once() {
    let db = test_database().await;
    let student_id = billed(&db, "REG-001", 50_000).await;
    let PaymentInsert::Inserted { payment: pending, .. } = db
        .insert_payment(&payment(student_id, 15_000, "BANK-1", PaymentStatus::Pending))
        .await
        .unwrap()
    else {
        panic!("pending payment should insert");
    };

    let confirms = join_all((0..2).map(|_| {
        db.transition_payment(
            pending.payment_id,
            PaymentStatus::Pending,
            PaymentStatus::Confirmed,
            None,
        )
    }))
    .await;

    let applied = confirms
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|change| change.is_some())
        .count();
    assert_eq!(applied, 1);
    let record = db.find_fee_record(student_id, SEMESTER).await.unwrap().unwrap();
    assert_eq!(record.paid_amount, amount(15_000));
}

#[tokio::test]
#[ignore]
async fn confirming_for_an_unbilled_semester_changes_nothing() {
    let db = test_database().await;
    let student_id = billed(&db, "REG-001", 50_000).await;
    let submitted = NewPayment {
        semester: Some("2025-Semester-2".to_string()),
        ..payment(student_id, 15_000, "BANK-S2", PaymentStatus::Pending)
    };
    let PaymentInsert::Inserted { payment: pending, .. } =
        db.insert_payment(&submitted).await.unwrap()
    else {
        panic!("pending payment should insert");
    };

    let err = db
        .transition_payment(
            pending.payment_id,
            PaymentStatus::Pending,
            PaymentStatus::Confirmed,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let stored = db.get_payment(pending.payment_id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
    assert_eq!(stored.semester.as_deref(), Some("2025-Semester-2"));
}

#[tokio::test]
#[ignore]
async fn concurrent_payments_are_all_applied() {
    let db = test_database().await;
    let student_id = billed(&db, "REG-001", 50_000).await;

    let payments: Vec<NewPayment> = (0..20)
        .map(|i| payment(student_id, 100, &format!("REF-{}", i), PaymentStatus::Confirmed))
        .collect();
    let outcomes = join_all(payments.iter().map(|p| db.insert_payment(p))).await;

    assert!(outcomes
        .into_iter()
        .all(|o| matches!(o, Ok(PaymentInsert::Inserted { .. }))));
    let record = db.find_fee_record(student_id, SEMESTER).await.unwrap().unwrap();
    assert_eq!(record.paid_amount, amount(2_000));
}

#[tokio::test]
#[ignore]
async fn paid_total_past_the_column_is_a_bad_request() {
    let db = test_database().await;
    let student_id = billed(&db, "REG-001", 50_000).await;
    let full = NewPayment {
        amount: max_amount(),
        ..payment(student_id, 0, "MAX-1", PaymentStatus::Confirmed)
    };
    db.insert_payment(&full).await.unwrap();

    let err = db
        .insert_payment(&payment(student_id, 1, "MAX-2", PaymentStatus::Confirmed))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::BadRequest(_)));
    let record = db.find_fee_record(student_id, SEMESTER).await.unwrap().unwrap();
    assert_eq!(record.paid_amount, max_amount());
    assert!(db.find_payment_by_reference("MAX-2").await.unwrap().is_none());
}
