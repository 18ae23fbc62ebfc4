mod common;

use common::{amount, dec, spawn_app, TestApp};
use serde_json::Value;

/// Three students: billed 50k/45k/30k, paid 20k/45k/10k.
async fn seed_ledger(app: &TestApp) {
    let a = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    let b = app.seed_student("REG-002", "Brian Kip", "BCom", 2).await;
    let c = app.seed_student("REG-003", "Chebet Mutai", "BSc Nursing", 1).await;

    for (student, billed, paid) in [(&a, 50_000, 20_000), (&b, 45_000, 45_000), (&c, 30_000, 10_000)] {
        app.bill(student.student_id, billed).await;
        assert_eq!(app.pay(student.student_id, paid).await.status().as_u16(), 200);
    }
}

#[tokio::test]
async fn dashboard_collection_rate_matches_fixtures() {
    let app = spawn_app().await;
    seed_ledger(&app).await;

    let response = app.get("/finance/dashboard?period=current_month").await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();

    let overview = &body["overview"];
    assert_eq!(overview["total_students"], 3);
    assert_eq!(dec(&overview["total_billed"]), amount(125_000));
    assert_eq!(dec(&overview["total_paid"]), amount(75_000));
    assert_eq!(dec(&overview["total_outstanding"]), amount(50_000));
    assert_eq!(overview["collection_rate"], 60);

    assert_eq!(body["period"]["period"], "current_month");
    assert_eq!(dec(&body["period"]["revenue"]), amount(75_000));
    assert_eq!(body["period"]["payment_count"], 3);
}

#[tokio::test]
async fn dashboard_breakdowns() {
    let app = spawn_app().await;
    seed_ledger(&app).await;

    let body: Value = app.get("/finance/dashboard").await.json().await.unwrap();

    assert_eq!(body["payment_status"]["confirmed"], 3);
    assert_eq!(body["payment_status"]["pending"], 0);
    assert_eq!(dec(&body["payment_methods"]["mpesa"]), amount(75_000));

    let bcom = &body["by_course"]["BCom"];
    assert_eq!(bcom["students"], 2);
    assert_eq!(dec(&bcom["total_billed"]), amount(95_000));
    assert_eq!(bcom["collection_rate"], 68);
    assert_eq!(body["by_year"]["1"]["students"], 2);

    let defaulters = body["top_defaulters"].as_array().unwrap();
    assert_eq!(defaulters.len(), 2);
    assert_eq!(defaulters[0]["registration_number"], "REG-001");
    assert_eq!(dec(&defaulters[0]["outstanding"]), amount(30_000));
    assert_eq!(defaulters[1]["registration_number"], "REG-003");

    let payers = body["top_payers"].as_array().unwrap();
    assert_eq!(payers.len(), 1);
    assert_eq!(payers[0]["registration_number"], "REG-002");

    let recent = body["recent_payments"].as_array().unwrap();
    assert_eq!(recent.len(), 3);
    assert!(recent.iter().all(|p| p["student_name"].is_string()));

    let trend = body["monthly_trend"].as_array().unwrap();
    assert_eq!(trend.len(), 12);
    assert_eq!(dec(&trend[11]["revenue"]), amount(75_000));
}

#[tokio::test]
async fn pending_payments_do_not_count_as_revenue() {
    let app = spawn_app().await;
    let student = app.seed_student("REG-001", "Achieng Otieno", "BCom", 1).await;
    app.bill(student.student_id, 40_000).await;
    app.submit(student.student_id, 10_000, "BANK-1").await;

    let body: Value = app.get("/finance/dashboard").await.json().await.unwrap();

    assert_eq!(dec(&body["overview"]["total_paid"]), amount(0));
    assert_eq!(body["overview"]["collection_rate"], 0);
    assert_eq!(body["payment_status"]["pending"], 1);
    assert_eq!(body["recent_payments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_ledger_has_zero_rates() {
    let app = spawn_app().await;

    let body: Value = app.get("/finance/dashboard?period=last_year").await.json().await.unwrap();

    assert_eq!(body["overview"]["total_students"], 0);
    assert_eq!(body["overview"]["collection_rate"], 0);
    assert_eq!(body["period"]["payment_count"], 0);
}

#[tokio::test]
async fn unknown_period_is_400() {
    let app = spawn_app().await;

    let response = app.get("/finance/dashboard?period=last_decade").await;

    assert_eq!(response.status().as_u16(), 400);
}
