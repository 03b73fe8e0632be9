//! Withdrawal fee schedule

use serde::Serialize;

use crate::types::{Amount, BasisPoints, Result, UplineError};

/// Percentage plus flat fee, with a minimum gross amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSchedule {
    pub minimum: Amount,
    pub percent: BasisPoints,
    pub flat: Amount,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            minimum: Amount::from_units(10),
            percent: BasisPoints::percent(5),
            flat: Amount::ZERO,
        }
    }
}

/// Fee breakdown for a gross withdrawal amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    pub amount: Amount,
    pub fee: Amount,
    pub net_amount: Amount,
}

impl FeeSchedule {
    /// Fee is the percentage rounded up to the cent, plus the flat part
    pub fn fee_for(&self, amount: Amount) -> Amount {
        amount.percent_ceil(self.percent) + self.flat
    }

    pub fn quote(&self, amount: Amount) -> Result<FeeQuote> {
        if !amount.is_positive() {
            return Err(UplineError::BadRequest("Amount must be positive".into()));
        }
        if amount < self.minimum {
            return Err(UplineError::BadRequest(format!(
                "Minimum withdrawal is {}",
                self.minimum
            )));
        }

        let fee = self.fee_for(amount);
        let net_amount = amount - fee;
        if !net_amount.is_positive() {
            return Err(UplineError::BadRequest(format!(
                "Fee {fee} consumes the whole amount"
            )));
        }

        Ok(FeeQuote {
            amount,
            fee,
            net_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quote() {
        let quote = FeeSchedule::default().quote(Amount::from_units(100)).unwrap();
        assert_eq!(quote.fee, Amount::from_units(5));
        assert_eq!(quote.net_amount, Amount::from_units(95));
    }

    #[test]
    fn test_fee_rounds_up() {
        // 5% of 10.01 is 0.5005
        let quote = FeeSchedule::default().quote(Amount::from_cents(1001)).unwrap();
        assert_eq!(quote.fee, Amount::from_cents(51));
        assert_eq!(quote.net_amount, Amount::from_cents(950));
    }

    #[test]
    fn test_flat_fee_added() {
        let fees = FeeSchedule {
            flat: Amount::from_units(1),
            ..FeeSchedule::default()
        };
        let quote = fees.quote(Amount::from_units(20)).unwrap();
        assert_eq!(quote.fee, Amount::from_units(2));
        assert_eq!(quote.net_amount, Amount::from_units(18));
    }

    #[test]
    fn test_below_minimum_rejected() {
        let err = FeeSchedule::default().quote(Amount::from_cents(999)).unwrap_err();
        assert!(matches!(err, UplineError::BadRequest(_)));
        assert!(FeeSchedule::default().quote(Amount::ZERO).is_err());
        assert!(FeeSchedule::default().quote(Amount::from_cents(-500)).is_err());
    }

    #[test]
    fn test_fee_cannot_swallow_amount() {
        let fees = FeeSchedule {
            minimum: Amount::from_cents(1),
            percent: BasisPoints::ZERO,
            flat: Amount::from_units(5),
        };
        assert!(fees.quote(Amount::from_units(5)).is_err());
        assert!(fees.quote(Amount::from_cents(501)).is_ok());
    }
}
