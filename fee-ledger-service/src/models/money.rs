//! Money amounts as the ledger stores them: `NUMERIC(14,2)`.

use rust_decimal::Decimal;
use service_core::error::AppError;

/// Decimal places kept for money.
pub const MONEY_SCALE: u32 = 2;

/// Largest amount a money column holds: 999,999,999,999.99.
pub fn max_amount() -> Decimal {
    Decimal::new(99_999_999_999_999, MONEY_SCALE)
}

/// Reject amounts a money column would round or overflow.
pub fn storable_amount(amount: Decimal, field: &str) -> Result<Decimal, AppError> {
    if amount.normalize().scale() > MONEY_SCALE {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "{} must have at most {} decimal places",
            field,
            MONEY_SCALE
        )));
    }
    if amount.abs() > max_amount() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "{} must not exceed {}",
            field,
            max_amount()
        )));
    }
    Ok(amount)
}

/// `paid + amount`, or an error when the total would not fit a money column.
pub fn add_paid(paid: Decimal, amount: Decimal) -> Result<Decimal, AppError> {
    paid.checked_add(amount)
        .filter(|total| total.abs() <= max_amount())
        .ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Paid total would exceed {}",
                max_amount()
            ))
        })
}

/// Sum for reports; saturates instead of overflowing.
pub fn total<I: IntoIterator<Item = Decimal>>(amounts: I) -> Decimal {
    amounts.into_iter().fold(Decimal::ZERO, Decimal::saturating_add)
}

/// `*sum += amount`, saturating.
pub fn accumulate(sum: &mut Decimal, amount: Decimal) {
    *sum = sum.saturating_add(amount);
}
