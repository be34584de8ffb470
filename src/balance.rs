/// BALANCE GUARD - the only place new balances are computed
///
/// Every balance the stores ever persist is produced here. The guard is pure:
/// no state, no I/O, safe to call from any number of tasks at once.
///
/// # Enforcement Strategy:
/// 1. `Amount` is unsigned - a negative balance is unrepresentable
/// 2. Debits check `current >= amount` before subtracting
/// 3. Credits use checked arithmetic capped at `MAX_AMOUNT`
/// 4. Zero amounts are rejected on every path
use rust_decimal::Decimal;
use thiserror::Error;

use crate::money::{self, Amount, MAX_AMOUNT, MoneyError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Amount, requested: Amount },

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount precision exceeds currency minor unit: {provided} > {max} decimals")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Balance would exceed the representable maximum")]
    BalanceOverflow,
}

impl From<MoneyError> for GuardError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::PrecisionOverflow { provided, max } => {
                GuardError::PrecisionOverflow { provided, max }
            }
            MoneyError::Overflow => GuardError::BalanceOverflow,
            MoneyError::InvalidAmount | MoneyError::InvalidFormat(_) => GuardError::InvalidAmount,
        }
    }
}

/// Stateless balance computations
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceGuard;

impl BalanceGuard {
    /// Reject zero amounts
    #[inline]
    pub fn validate_amount(amount: Amount) -> Result<(), GuardError> {
        if amount.is_zero() {
            return Err(GuardError::InvalidAmount);
        }
        if *amount > MAX_AMOUNT {
            return Err(GuardError::BalanceOverflow);
        }
        Ok(())
    }

    /// Validate a client-facing decimal against the currency's minor unit and
    /// convert it. `12.345` is rejected for a 2-decimal currency rather than
    /// rounded.
    pub fn validate_decimal(amount: Decimal, decimals: u32) -> Result<Amount, GuardError> {
        Ok(money::parse_decimal(amount, decimals)?)
    }

    /// Balance after removing `amount`
    ///
    /// # Errors
    /// - `InvalidAmount` if amount is zero
    /// - `InsufficientFunds` if `current < amount`
    pub fn compute_debit(current: Amount, amount: Amount) -> Result<Amount, GuardError> {
        Self::validate_amount(amount)?;
        current
            .checked_sub(amount)
            .ok_or(GuardError::InsufficientFunds {
                balance: current,
                requested: amount,
            })
    }

    /// Balance after adding `amount`
    ///
    /// # Errors
    /// - `InvalidAmount` if amount is zero
    /// - `BalanceOverflow` if the result exceeds `MAX_AMOUNT`
    pub fn compute_credit(current: Amount, amount: Amount) -> Result<Amount, GuardError> {
        Self::validate_amount(amount)?;
        current
            .checked_add(amount)
            .filter(|v| **v <= MAX_AMOUNT)
            .ok_or(GuardError::BalanceOverflow)
    }
}
