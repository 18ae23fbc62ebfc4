//! Billing integration tests: single bills, bulk billing, amendments and
//! read views.

mod common;

use common::{amount, dec, spawn_app, SEMESTER};
use fee_ledger_service::services::LedgerStore;
use futures::future::join_all;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn create_fee_record() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;

    let body = app.bill(student.student_id, 50_000).await;

    assert_eq!(body["created"], true);
    assert_eq!(body["already_billed"], false);
    assert!(body.get("warning").is_none());
    let record = &body["fee_record"];
    assert_eq!(dec(&record["billed_amount"]), amount(50_000));
    assert_eq!(dec(&record["paid_amount"]), amount(0));
    assert_eq!(record["semester"], SEMESTER);
    assert_eq!(record["summary"]["status"], "unpaid");

    let notices = app.notifications.wait_for(1).await;
    assert_eq!(notices[0].title, "Fee Statement Created");
    assert_eq!(notices[0].recipient_id, student.student_id);
}

#[tokio::test]
async fn second_bill_returns_warning_and_keeps_record() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    app.bill(student.student_id, 50_000).await;

    let response = app
        .post(
            "/fees",
            &json!({
                "student_id": student.student_id,
                "semester": SEMESTER,
                "total_fee": 65_000
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["already_billed"], true);
    assert!(body["warning"].as_str().unwrap().contains("force_update"));
    assert_eq!(dec(&body["fee_record"]["billed_amount"]), amount(50_000));
}

#[tokio::test]
async fn forced_rebill_keeps_paid_amount() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    app.bill(student.student_id, 50_000).await;
    assert_eq!(app.pay(student.student_id, 20_000).await.status().as_u16(), 200);

    let response = app
        .post(
            "/fees",
            &json!({
                "student_id": student.student_id,
                "semester": SEMESTER,
                "total_billed": 55_000,
                "force_update": true
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["created"], false);
    assert_eq!(dec(&body["previous_amount"]), amount(50_000));
    assert_eq!(dec(&body["fee_record"]["billed_amount"]), amount(55_000));
    assert_eq!(dec(&body["fee_record"]["paid_amount"]), amount(20_000));
    assert_eq!(dec(&body["fee_record"]["summary"]["balance"]), amount(35_000));
}

#[tokio::test]
async fn opening_payment_is_recorded_as_a_payment() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;

    let response = app
        .post(
            "/fees",
            &json!({
                "student_id": student.student_id,
                "semester": SEMESTER,
                "total_fee": 40_000,
                "amount_paid": 10_000
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(dec(&body["fee_record"]["paid_amount"]), amount(10_000));
    assert_eq!(body["opening_payment"]["payment_method"], "opening_balance");
    assert_eq!(body["opening_payment"]["status"], "confirmed");

    let payments = app.store.list_student_payments(student.student_id).await.unwrap();
    assert_eq!(payments.len(), 1);
}

#[tokio::test]
async fn concurrent_first_bills_record_one_bill_and_one_opening_payment() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;

    let bodies: Vec<Value> = [50_000, 99_000]
        .iter()
        .map(|total| {
            json!({
                "student_id": student.student_id,
                "semester": SEMESTER,
                "total_fee": total,
                "amount_paid": 1_000
            })
        })
        .collect();
    let responses = join_all(bodies.iter().map(|body| app.post("/fees", body))).await;

    let mut created = Vec::new();
    for response in responses {
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        if body["created"] == true {
            created.push(dec(&body["fee_record"]["billed_amount"]));
        } else {
            assert_eq!(body["already_billed"], true);
        }
    }

    assert_eq!(created.len(), 1);
    let record = app.fee_record(student.student_id).await.unwrap();
    assert_eq!(record.billed_amount, created[0]);
    assert_eq!(record.paid_amount, amount(1_000));
    let payments = app.store.list_student_payments(student.student_id).await.unwrap();
    assert_eq!(payments.len(), 1);
}

#[tokio::test]
async fn forced_rebill_without_due_date_keeps_the_due_date() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    app.bill(student.student_id, 50_000).await;

    let response = app
        .post(
            "/fees",
            &json!({
                "student_id": student.student_id,
                "semester": SEMESTER,
                "total_fee": 52_000,
                "force_update": true
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["fee_record"]["due_date"], "2025-02-28");
}

#[tokio::test]
async fn amounts_the_ledger_cannot_hold_are_400() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;

    let bills = [
        json!({ "student_id": student.student_id, "semester": SEMESTER, "total_fee": "0.004" }),
        json!({ "student_id": student.student_id, "semester": SEMESTER, "total_fee": "10000000000000" }),
        json!({
            "student_id": student.student_id,
            "semester": SEMESTER,
            "total_fee": 40_000,
            "amount_paid": "0.001"
        }),
    ];
    for body in bills {
        let response = app.post("/fees", &body).await;
        assert_eq!(response.status().as_u16(), 400, "body {} was accepted", body);
    }
    assert!(app.fee_record(student.student_id).await.is_none());

    let fee_id = app.bill(student.student_id, 50_000).await["fee_record"]["fee_id"].clone();
    let response = app
        .patch(
            "/fees",
            &json!({
                "action": "update_fee",
                "data": { "fee_id": fee_id, "total_fee": "1000000000000" }
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);

    for paid in ["0.004", "1000000000000"] {
        let response = app
            .put(
                "/fees",
                &json!({
                    "student_id": student.student_id,
                    "semester": SEMESTER,
                    "payment_amount": paid
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 400, "payment {} was accepted", paid);
    }

    let record = app.fee_record(student.student_id).await.unwrap();
    assert_eq!(record.billed_amount, amount(50_000));
    assert_eq!(record.paid_amount, amount(0));
}

#[tokio::test]
async fn billing_unknown_student_is_404() {
    let app = spawn_app().await;

    let response = app
        .post(
            "/fees",
            &json!({
                "student_id": Uuid::new_v4(),
                "semester": SEMESTER,
                "total_fee": 1_000
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn missing_or_bad_fields_are_400() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;

    let bodies = [
        json!({ "semester": SEMESTER, "total_fee": 1_000 }),
        json!({ "student_id": student.student_id, "total_fee": 1_000 }),
        json!({ "student_id": student.student_id, "semester": SEMESTER }),
        json!({ "student_id": student.student_id, "semester": "", "total_fee": 1_000 }),
        json!({ "student_id": student.student_id, "semester": SEMESTER, "total_fee": -5 }),
        json!({ "student_id": student.student_id, "semester": SEMESTER, "total_fee": "lots" }),
    ];

    for body in bodies {
        let response = app.post("/fees", &body).await;
        assert_eq!(response.status().as_u16(), 400, "body {} was accepted", body);
        let error: Value = response.json().await.unwrap();
        assert!(error["error"].is_string());
    }
}

#[tokio::test]
async fn bulk_bill_skips_already_billed_students() {
    let app = spawn_app().await;
    let x = app.seed_student("REG-001", "Student X", "BCom", 1).await;
    let y = app.seed_student("REG-002", "Student Y", "BCom", 1).await;
    app.bill(x.student_id, 45_000).await;

    let response = app
        .patch(
            "/fees",
            &json!({
                "action": "bulk_bill",
                "data": {
                    "student_ids": [x.student_id, y.student_id],
                    "semester": SEMESTER,
                    "total_fee": 50_000,
                    "skip_existing": true
                }
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["processed_count"], 1);
    assert_eq!(body["skipped_count"], 1);
    assert_eq!(body["processed"], json!([y.student_id]));
    assert_eq!(body["skipped"], json!([x.student_id]));

    let x_record = app.fee_record(x.student_id).await.unwrap();
    assert_eq!(x_record.billed_amount, amount(45_000));
    let y_record = app.fee_record(y.student_id).await.unwrap();
    assert_eq!(y_record.balance(), amount(50_000));
}

#[tokio::test]
async fn bulk_rebill_keeps_paid_amounts() {
    let app = spawn_app().await;
    let x = app.seed_student("REG-001", "Student X", "BCom", 1).await;
    let y = app.seed_student("REG-002", "Student Y", "BCom", 1).await;
    app.bill(x.student_id, 45_000).await;
    app.pay(x.student_id, 15_000).await;

    let response = app
        .patch(
            "/fees",
            &json!({
                "action": "bulk_bill",
                "data": {
                    "student_ids": [x.student_id, y.student_id],
                    "semester": SEMESTER,
                    "total_fee": 50_000,
                    "skip_existing": false
                }
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["processed_count"], 2);
    assert_eq!(body["skipped_count"], 0);
    assert_eq!(body["already_billed_count"], 1);

    let x_record = app.fee_record(x.student_id).await.unwrap();
    assert_eq!(x_record.billed_amount, amount(50_000));
    assert_eq!(x_record.paid_amount, amount(15_000));
}

#[tokio::test]
async fn bulk_bill_with_everyone_billed_is_a_no_op() {
    let app = spawn_app().await;
    let x = app.seed_student("REG-001", "Student X", "BCom", 1).await;
    app.bill(x.student_id, 45_000).await;
    app.notifications.wait_for(1).await;

    let response = app
        .patch(
            "/fees",
            &json!({
                "action": "bulk_bill",
                "data": {
                    "student_ids": [x.student_id],
                    "semester": SEMESTER,
                    "total_fee": 50_000
                }
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["processed_count"], 0);
    assert_eq!(body["skipped"], json!([x.student_id]));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(app.notifications.notices().len(), 1);
}

#[tokio::test]
async fn bulk_bill_notifies_each_processed_student() {
    let app = spawn_app().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let student = app
            .seed_student(&format!("REG-00{}", i), "Student", "BCom", 1)
            .await;
        ids.push(student.student_id);
    }

    app.patch(
        "/fees",
        &json!({
            "action": "bulk_bill",
            "data": { "student_ids": ids, "semester": SEMESTER, "total_fee": 1_000 }
        }),
    )
    .await;

    let notices = app.notifications.wait_for(3).await;
    assert_eq!(notices.len(), 3);
    assert!(notices.iter().all(|n| n.title == "Fee Statement Created"));
}

#[tokio::test]
async fn bulk_bill_rejects_bad_input() {
    let app = spawn_app().await;

    let bodies = [
        json!({ "action": "bulk_bill", "data": { "student_ids": [], "semester": SEMESTER, "total_fee": 1 } }),
        json!({ "action": "bulk_bill", "data": { "student_ids": "everyone", "semester": SEMESTER, "total_fee": 1 } }),
        json!({ "action": "bulk_bill", "data": { "student_ids": [Uuid::new_v4()], "total_fee": 1 } }),
        json!({ "action": "bulk_bill", "data": { "student_ids": [Uuid::new_v4()], "semester": SEMESTER } }),
        json!({ "action": "archive", "data": {} }),
        json!({ "data": {} }),
    ];

    for body in bodies {
        let response = app.patch("/fees", &body).await;
        assert_eq!(response.status().as_u16(), 400, "body {} was accepted", body);
    }
}

#[tokio::test]
async fn update_fee_reports_old_and_new_amounts() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    let created = app.bill(student.student_id, 50_000).await;
    let fee_id = created["fee_record"]["fee_id"].as_str().unwrap().to_string();
    app.pay(student.student_id, 5_000).await;

    let response = app
        .patch(
            "/fees",
            &json!({
                "action": "update_fee",
                "data": { "fee_id": fee_id, "total_fee": 48_000, "due_date": "2025-03-31" }
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(dec(&body["old_amount"]), amount(50_000));
    assert_eq!(dec(&body["new_amount"]), amount(48_000));
    assert_eq!(body["fee_record"]["due_date"], "2025-03-31");
    assert_eq!(dec(&body["fee_record"]["paid_amount"]), amount(5_000));

    let notices = app.notifications.wait_for(3).await;
    assert!(notices
        .iter()
        .any(|n| n.title == "Fee Statement Updated" && n.body.contains(SEMESTER)));
}

#[tokio::test]
async fn update_unknown_fee_is_404() {
    let app = spawn_app().await;

    let response = app
        .patch(
            "/fees",
            &json!({
                "action": "update_fee",
                "data": { "fee_id": Uuid::new_v4(), "total_fee": 1_000 }
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn list_fees_joins_students_and_filters_by_semester() {
    let app = spawn_app().await;
    let b = app.seed_student("REG-002", "Brian Kip", "BCom", 2).await;
    let a = app.seed_student("REG-001", "Achieng Otieno", "BSc Nursing", 1).await;
    app.bill(b.student_id, 40_000).await;
    app.bill(a.student_id, 50_000).await;
    app.post(
        "/fees",
        &json!({ "student_id": a.student_id, "semester": "2025-Semester-2", "total_fee": 52_000 }),
    )
    .await;

    let all: Value = app.get("/fees").await.json().await.unwrap();
    assert_eq!(all["count"], 3);

    let response = app.get(&format!("/fees?semester={}", SEMESTER)).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["count"], 2);
    let fees = body["fees"].as_array().unwrap();
    assert_eq!(fees[0]["registration_number"], "REG-001");
    assert_eq!(fees[0]["student_name"], "Achieng Otieno");
    assert_eq!(fees[1]["registration_number"], "REG-002");
    assert_eq!(fees[1]["course"], "BCom");
}

#[tokio::test]
async fn student_statement_combines_semesters() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    app.bill(student.student_id, 50_000).await;
    app.post(
        "/fees",
        &json!({ "student_id": student.student_id, "semester": "2025-Semester-2", "total_fee": 30_000 }),
    )
    .await;
    app.pay(student.student_id, 50_000).await;

    let response = app
        .get(&format!("/fees/students/{}", student.student_id))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["student"]["registration_number"], "REG-001");
    assert_eq!(body["semesters"].as_array().unwrap().len(), 2);
    assert_eq!(body["payments"].as_array().unwrap().len(), 1);

    let summary = &body["summary"];
    assert_eq!(dec(&summary["total_billed"]), amount(80_000));
    assert_eq!(dec(&summary["total_paid"]), amount(50_000));
    assert_eq!(dec(&summary["balance"]), amount(30_000));
    assert_eq!(summary["progress_pct"], 63);
    assert_eq!(summary["status"], "partial");
    assert_eq!(summary["can_access_exam_card"], true);
}

#[tokio::test]
async fn statement_for_unknown_student_is_404() {
    let app = spawn_app().await;

    let response = app.get(&format!("/fees/students/{}", Uuid::new_v4())).await;

    assert_eq!(response.status().as_u16(), 404);
}
