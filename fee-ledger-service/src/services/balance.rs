//! Balance derivation.
//!
//! Pure functions over billed and paid totals. Nothing here touches the
//! store; callers pass the records and the current date in.

use crate::models::money::total;
use crate::models::{FeeRecord, PaymentRecord, PaymentStatus};
use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Payment standing of a bill or a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStatus {
    Unpaid,
    Partial,
    Paid,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeStatus::Unpaid => "unpaid",
            FeeStatus::Partial => "partial",
            FeeStatus::Paid => "paid",
        }
    }
}

/// Derived figures; never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceView {
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub balance: Decimal,
    pub progress_pct: u32,
    pub status: FeeStatus,
    pub can_access_exam_card: bool,
    pub is_overdue: bool,
}

/// Product rules applied on top of the raw numbers.
#[derive(Debug, Clone, Copy)]
pub struct BalancePolicy {
    pub grace_period_days: i64,
    pub exam_card_threshold_pct: u32,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        Self {
            grace_period_days: 30,
            exam_card_threshold_pct: 60,
        }
    }
}

/// `round(part / whole * 100)`, halves rounded away from zero; 0 when
/// `whole <= 0`.
pub fn percentage(part: Decimal, whole: Decimal) -> u32 {
    if whole <= Decimal::ZERO || part <= Decimal::ZERO {
        return 0;
    }
    part.checked_div(whole)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .and_then(|pct| {
            pct.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_u32()
        })
        .unwrap_or(u32::MAX)
}

pub fn fee_status(total_billed: Decimal, total_paid: Decimal) -> FeeStatus {
    let balance = total_billed - total_paid;
    if balance <= Decimal::ZERO {
        FeeStatus::Paid
    } else if total_paid > Decimal::ZERO {
        FeeStatus::Partial
    } else {
        FeeStatus::Unpaid
    }
}

/// Sum of confirmed payment amounts.
pub fn confirmed_total<'a>(payments: impl IntoIterator<Item = &'a PaymentRecord>) -> Decimal {
    total(
        payments
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Confirmed)
            .map(|p| p.amount),
    )
}

impl BalancePolicy {
    /// Derive the view from totals. `due_date` is the date the outstanding
    /// amount fell due, if any.
    pub fn view(
        &self,
        total_billed: Decimal,
        total_paid: Decimal,
        due_date: Option<NaiveDate>,
        today: NaiveDate,
    ) -> BalanceView {
        let balance = total_billed - total_paid;
        let progress_pct = percentage(total_paid, total_billed);
        let is_overdue = balance > Decimal::ZERO
            && due_date
                .map(|due| today > due + Duration::days(self.grace_period_days))
                .unwrap_or(false);

        BalanceView {
            total_billed,
            total_paid,
            balance,
            progress_pct,
            status: fee_status(total_billed, total_paid),
            can_access_exam_card: progress_pct >= self.exam_card_threshold_pct,
            is_overdue,
        }
    }

    /// Semester-scoped view of one bill.
    pub fn record_view(&self, record: &FeeRecord, today: NaiveDate) -> BalanceView {
        self.view(
            record.billed_amount,
            record.paid_amount,
            record.due_date,
            today,
        )
    }

    /// Cross-semester view: every bill against every confirmed payment.
    /// Overdue is judged against the earliest due date among bills that are
    /// still outstanding on their own.
    pub fn student_view(
        &self,
        records: &[FeeRecord],
        payments: &[PaymentRecord],
        today: NaiveDate,
    ) -> BalanceView {
        let total_billed = total(records.iter().map(|r| r.billed_amount));
        let total_paid = confirmed_total(payments);
        let earliest_outstanding_due = records
            .iter()
            .filter(|r| r.balance() > Decimal::ZERO)
            .filter_map(|r| r.due_date)
            .min();

        self.view(total_billed, total_paid, earliest_outstanding_due, today)
    }
}
