//! Reporting Aggregator.
//!
//! Reports are computed in memory over a snapshot of the whole ledger. The
//! snapshot is not isolated from concurrent writes; reports are informational.

use crate::models::money::{accumulate, total};
use crate::models::{PaymentRecord, PaymentStatus, Student};
use crate::services::balance::percentage;
use crate::services::metrics::record_report_duration;
use crate::services::store::{LedgerSnapshot, LedgerStore};
use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

const TOP_N: usize = 10;
const RECENT_N: usize = 10;
const TREND_MONTHS: i32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPeriod {
    CurrentMonth,
    LastMonth,
    CurrentYear,
    LastYear,
}

impl ReportPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "current_month" => Some(ReportPeriod::CurrentMonth),
            "last_month" => Some(ReportPeriod::LastMonth),
            "current_year" => Some(ReportPeriod::CurrentYear),
            "last_year" => Some(ReportPeriod::LastYear),
            _ => None,
        }
    }

    /// Inclusive date range the period covers, relative to `today`.
    pub fn range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let (year, month) = (today.year(), today.month());
        match self {
            ReportPeriod::CurrentMonth => (month_start(year, month), month_end(year, month)),
            ReportPeriod::LastMonth => {
                let (y, m) = shift_month(year, month, -1);
                (month_start(y, m), month_end(y, m))
            }
            ReportPeriod::CurrentYear => (month_start(year, 1), month_end(year, 12)),
            ReportPeriod::LastYear => (month_start(year - 1, 1), month_end(year - 1, 12)),
        }
    }
}

fn month_start(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default()
}

fn month_end(year: i32, month: u32) -> NaiveDate {
    let (y, m) = shift_month(year, month, 1);
    month_start(y, m) - Duration::days(1)
}

fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

// ============================================================================
// Report shapes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub total_students: usize,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub total_outstanding: Decimal,
    pub collection_rate: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodSummary {
    pub period: ReportPeriod,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub revenue: Decimal,
    pub payment_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupTotals {
    pub students: usize,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub outstanding: Decimal,
    pub collection_rate: u32,
}

/// One student's cross-semester position.
#[derive(Debug, Clone, Serialize)]
pub struct StudentStanding {
    pub student_id: Uuid,
    pub registration_number: String,
    pub name: String,
    pub course: String,
    pub year_of_study: i32,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub outstanding: Decimal,
}

/// Payment joined with the student it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentLine {
    #[serde(flatten)]
    pub payment: PaymentRecord,
    pub student_name: Option<String>,
    pub registration_number: Option<String>,
    pub course: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthBucket {
    pub month: String,
    pub revenue: Decimal,
    pub payment_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub overview: Overview,
    pub period: PeriodSummary,
    pub payment_status: StatusCounts,
    pub payment_methods: BTreeMap<String, Decimal>,
    pub by_course: BTreeMap<String, GroupTotals>,
    pub by_year: BTreeMap<i32, GroupTotals>,
    pub recent_payments: Vec<PaymentLine>,
    pub top_defaulters: Vec<StudentStanding>,
    pub top_payers: Vec<StudentStanding>,
    pub monthly_trend: Vec<MonthBucket>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub search: Option<String>,
    pub status: Option<PaymentStatus>,
    pub payment_method: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_count: usize,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentSummary {
    pub total_payments: usize,
    pub confirmed: usize,
    pub pending: usize,
    pub rejected: usize,
    pub total_amount: Decimal,
    pub average_payment: Decimal,
    pub by_method: BTreeMap<String, Decimal>,
    pub by_month: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentPage {
    pub payments: Vec<PaymentLine>,
    pub pagination: Pagination,
    pub summary: PaymentSummary,
}

// ============================================================================
// Aggregation
// ============================================================================

fn confirmed(payments: &[PaymentRecord]) -> impl Iterator<Item = &PaymentRecord> {
    payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Confirmed)
}

fn status_counts(payments: &[PaymentRecord]) -> StatusCounts {
    payments.iter().fold(
        StatusCounts {
            total: payments.len(),
            ..StatusCounts::default()
        },
        |mut counts, p| {
            match p.status {
                PaymentStatus::Pending => counts.pending += 1,
                PaymentStatus::Confirmed => counts.confirmed += 1,
                PaymentStatus::Rejected => counts.rejected += 1,
            }
            counts
        },
    )
}

fn method_totals(payments: &[PaymentRecord]) -> BTreeMap<String, Decimal> {
    let mut totals = BTreeMap::new();
    for p in confirmed(payments) {
        accumulate(
            totals.entry(p.payment_method.clone()).or_insert(Decimal::ZERO),
            p.amount,
        );
    }
    totals
}

fn month_totals(payments: &[PaymentRecord]) -> BTreeMap<String, Decimal> {
    let mut totals = BTreeMap::new();
    for p in confirmed(payments) {
        accumulate(
            totals
                .entry(month_key(p.payment_date.date_naive()))
                .or_insert(Decimal::ZERO),
            p.amount,
        );
    }
    totals
}

/// Billed and confirmed-paid totals per student, in `snapshot.students` order.
fn standings(snapshot: &LedgerSnapshot) -> Vec<StudentStanding> {
    let mut billed: HashMap<Uuid, Decimal> = HashMap::new();
    for record in &snapshot.fee_records {
        accumulate(
            billed.entry(record.student_id).or_insert(Decimal::ZERO),
            record.billed_amount,
        );
    }
    let mut paid: HashMap<Uuid, Decimal> = HashMap::new();
    for p in confirmed(&snapshot.payments) {
        accumulate(paid.entry(p.student_id).or_insert(Decimal::ZERO), p.amount);
    }

    snapshot
        .students
        .iter()
        .map(|s| {
            let total_billed = billed.get(&s.student_id).copied().unwrap_or_default();
            let total_paid = paid.get(&s.student_id).copied().unwrap_or_default();
            StudentStanding {
                student_id: s.student_id,
                registration_number: s.registration_number.clone(),
                name: s.name.clone(),
                course: s.course.clone(),
                year_of_study: s.year_of_study,
                total_billed,
                total_paid,
                outstanding: total_billed - total_paid,
            }
        })
        .collect()
}

fn add_to_group(group: &mut GroupTotals, standing: &StudentStanding) {
    group.students += 1;
    accumulate(&mut group.total_billed, standing.total_billed);
    accumulate(&mut group.total_paid, standing.total_paid);
    group.outstanding = group.total_billed - group.total_paid;
    group.collection_rate = percentage(group.total_paid, group.total_billed);
}

fn payment_line(payment: &PaymentRecord, students: &HashMap<Uuid, &Student>) -> PaymentLine {
    let student = students.get(&payment.student_id);
    PaymentLine {
        payment: payment.clone(),
        student_name: student.map(|s| s.name.clone()),
        registration_number: student.map(|s| s.registration_number.clone()),
        course: student.map(|s| s.course.clone()),
    }
}

fn student_index(students: &[Student]) -> HashMap<Uuid, &Student> {
    students.iter().map(|s| (s.student_id, s)).collect()
}

/// Newest first. Equal dates keep snapshot order.
fn by_date_desc(payments: &mut [&PaymentRecord]) {
    payments.sort_by(|a, b| b.payment_date.cmp(&a.payment_date));
}

/// Build the finance dashboard for `period` as of `today`.
pub fn build_dashboard(snapshot: &LedgerSnapshot, period: ReportPeriod, today: NaiveDate) -> Dashboard {
    let total_billed = total(snapshot.fee_records.iter().map(|r| r.billed_amount));
    let total_paid = total(confirmed(&snapshot.payments).map(|p| p.amount));

    let overview = Overview {
        total_students: snapshot.students.len(),
        total_billed,
        total_paid,
        total_outstanding: total_billed - total_paid,
        collection_rate: percentage(total_paid, total_billed),
    };

    let (start_date, end_date) = period.range(today);
    let in_period: Vec<&PaymentRecord> = confirmed(&snapshot.payments)
        .filter(|p| {
            let date = p.payment_date.date_naive();
            date >= start_date && date <= end_date
        })
        .collect();
    let period_summary = PeriodSummary {
        period,
        start_date,
        end_date,
        revenue: total(in_period.iter().map(|p| p.amount)),
        payment_count: in_period.len(),
    };

    let standings = standings(snapshot);

    let mut by_course: BTreeMap<String, GroupTotals> = BTreeMap::new();
    let mut by_year: BTreeMap<i32, GroupTotals> = BTreeMap::new();
    for standing in &standings {
        add_to_group(by_course.entry(standing.course.clone()).or_default(), standing);
        add_to_group(by_year.entry(standing.year_of_study).or_default(), standing);
    }

    // Stable sorts: ties keep registration-number order from the snapshot.
    let mut top_defaulters: Vec<StudentStanding> = standings
        .iter()
        .filter(|s| s.outstanding > Decimal::ZERO)
        .cloned()
        .collect();
    top_defaulters.sort_by(|a, b| b.outstanding.cmp(&a.outstanding));
    top_defaulters.truncate(TOP_N);

    let mut top_payers: Vec<StudentStanding> = standings
        .iter()
        .filter(|s| s.outstanding <= Decimal::ZERO && s.total_paid > Decimal::ZERO)
        .cloned()
        .collect();
    top_payers.sort_by(|a, b| b.total_paid.cmp(&a.total_paid));
    top_payers.truncate(TOP_N);

    let students = student_index(&snapshot.students);
    let mut recent: Vec<&PaymentRecord> = snapshot.payments.iter().collect();
    by_date_desc(&mut recent);
    let recent_payments = recent
        .into_iter()
        .take(RECENT_N)
        .map(|p| payment_line(p, &students))
        .collect();

    Dashboard {
        overview,
        period: period_summary,
        payment_status: status_counts(&snapshot.payments),
        payment_methods: method_totals(&snapshot.payments),
        by_course,
        by_year,
        recent_payments,
        top_defaulters,
        top_payers,
        monthly_trend: monthly_trend(&snapshot.payments, today),
    }
}

/// Confirmed revenue for the twelve calendar months ending with the month of
/// `today`, oldest first.
pub fn monthly_trend(payments: &[PaymentRecord], today: NaiveDate) -> Vec<MonthBucket> {
    let mut buckets: Vec<MonthBucket> = (0..TREND_MONTHS)
        .rev()
        .map(|back| {
            let (y, m) = shift_month(today.year(), today.month(), -back);
            MonthBucket {
                month: month_key(month_start(y, m)),
                revenue: Decimal::ZERO,
                payment_count: 0,
            }
        })
        .collect();

    let index: HashMap<String, usize> = buckets
        .iter()
        .enumerate()
        .map(|(i, b)| (b.month.clone(), i))
        .collect();

    for p in confirmed(payments) {
        if let Some(&i) = index.get(&month_key(p.payment_date.date_naive())) {
            accumulate(&mut buckets[i].revenue, p.amount);
            buckets[i].payment_count += 1;
        }
    }
    buckets
}

impl PaymentFilter {
    fn matches(&self, payment: &PaymentRecord, student: Option<&&Student>) -> bool {
        if let Some(status) = self.status {
            if payment.status != status {
                return false;
            }
        }
        if let Some(method) = &self.payment_method {
            if !payment.payment_method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        let date = payment.payment_date.date_naive();
        if self.start_date.is_some_and(|start| date < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| date > end) {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = payment.reference_number.to_lowercase().contains(&needle)
                || student.is_some_and(|s| {
                    s.name.to_lowercase().contains(&needle)
                        || s.registration_number.to_lowercase().contains(&needle)
                });
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Summary statistics over every payment, regardless of any filter.
pub fn payment_summary(payments: &[PaymentRecord]) -> PaymentSummary {
    let counts = status_counts(payments);
    let total_amount = total(confirmed(payments).map(|p| p.amount));
    let average_payment = if counts.confirmed > 0 {
        (total_amount / Decimal::from(counts.confirmed)).round_dp(2)
    } else {
        Decimal::ZERO
    };

    PaymentSummary {
        total_payments: counts.total,
        confirmed: counts.confirmed,
        pending: counts.pending,
        rejected: counts.rejected,
        total_amount,
        average_payment,
        by_method: method_totals(payments),
        by_month: month_totals(payments),
    }
}

/// Filter, sort newest first, and cut one page. `total_count` counts the
/// filtered rows; the summary covers the unfiltered set.
pub fn payment_page(
    snapshot: &LedgerSnapshot,
    filter: &PaymentFilter,
    page: u32,
    limit: u32,
) -> PaymentPage {
    let page = page.max(1);
    let limit = limit.max(1);
    let students = student_index(&snapshot.students);

    let mut matching: Vec<&PaymentRecord> = snapshot
        .payments
        .iter()
        .filter(|p| filter.matches(p, students.get(&p.student_id)))
        .collect();
    by_date_desc(&mut matching);

    let total_count = matching.len();
    let total_pages = total_count.div_ceil(limit as usize) as u32;
    let offset = (page as usize - 1) * limit as usize;

    let payments = matching
        .into_iter()
        .skip(offset)
        .take(limit as usize)
        .map(|p| payment_line(p, &students))
        .collect();

    PaymentPage {
        payments,
        pagination: Pagination {
            page,
            limit,
            total_count,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        },
        summary: payment_summary(&snapshot.payments),
    }
}

/// Loads the ledger and hands it to the report builders.
#[derive(Clone)]
pub struct ReportingAggregator {
    store: Arc<dyn LedgerStore>,
}

impl ReportingAggregator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot, AppError> {
        let (students, fee_records, payments) = tokio::try_join!(
            self.store.list_students(),
            self.store.list_fee_records(None),
            self.store.list_payments(),
        )?;
        debug!(
            students = students.len(),
            fee_records = fee_records.len(),
            payments = payments.len(),
            "Ledger snapshot loaded"
        );
        Ok(LedgerSnapshot {
            students,
            fee_records,
            payments,
        })
    }

    #[instrument(skip(self))]
    pub async fn dashboard(&self, period: ReportPeriod, today: NaiveDate) -> Result<Dashboard, AppError> {
        let started = Instant::now();
        let snapshot = self.snapshot().await?;
        let dashboard = build_dashboard(&snapshot, period, today);
        record_report_duration("dashboard", started.elapsed().as_secs_f64());
        Ok(dashboard)
    }

    #[instrument(skip(self, filter))]
    pub async fn payments(
        &self,
        filter: &PaymentFilter,
        page: u32,
        limit: u32,
    ) -> Result<PaymentPage, AppError> {
        let started = Instant::now();
        let snapshot = self.snapshot().await?;
        let result = payment_page(&snapshot, filter, page, limit);
        record_report_duration("payment_list", started.elapsed().as_secs_f64());
        Ok(result)
    }
}
