//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Truncate toward zero at `decimals` places. Never rounds a sell above what is held.
pub fn truncate_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Whole contracts nearest to `quantity`, rounding halves away from zero.
///
/// Returns zero when the quantity is under half a contract.
pub fn contracts_nearest(quantity: Decimal, contract_size: Decimal) -> Decimal {
    if contract_size <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (quantity / contract_size).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Whole contracts that fit inside `quantity`.
pub fn contracts_within(quantity: Decimal, contract_size: Decimal) -> Decimal {
    if contract_size <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (quantity / contract_size).floor()
}

/// Whole contracts that cover `quantity`.
pub fn contracts_covering(quantity: Decimal, contract_size: Decimal) -> Decimal {
    if contract_size <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (quantity / contract_size).ceil()
}

/// Contract count for an opening or closing order: nearest whole contract,
/// at least one.
///
/// For any positive `quantity`, `contracts * contract_size` differs from it
/// by less than one contract size.
pub fn contracts_for(quantity: Decimal, contract_size: Decimal) -> Decimal {
    if contract_size <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    contracts_nearest(quantity, contract_size).max(Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_truncate_never_rounds_up() {
        assert_eq!(truncate_to_precision(dec!(1.23456789999), 8), dec!(1.23456789));
        assert_eq!(round_to_precision(dec!(1.23456789999), 8), dec!(1.23456790));
    }

    #[test]
    fn test_contracts_within_and_covering() {
        assert_eq!(contracts_within(dec!(55), dec!(10)), dec!(5));
        assert_eq!(contracts_covering(dec!(55), dec!(10)), dec!(6));
        assert_eq!(contracts_within(dec!(5), dec!(10)), Decimal::ZERO);
        assert_eq!(contracts_covering(dec!(20), dec!(10)), dec!(2));
        assert_eq!(contracts_covering(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_contracts_round_half_away() {
        assert_eq!(contracts_for(dec!(25), dec!(10)), dec!(3));
        assert_eq!(contracts_for(dec!(24.9), dec!(10)), dec!(2));
        assert_eq!(contracts_for(dec!(14.99), dec!(10)), dec!(1));
    }

    #[test]
    fn test_contracts_floor_of_one() {
        assert_eq!(contracts_for(dec!(0.3), dec!(10)), dec!(1));
        assert_eq!(contracts_nearest(dec!(0.3), dec!(10)), Decimal::ZERO);
        assert_eq!(contracts_for(Decimal::ZERO, dec!(10)), Decimal::ZERO);
        assert_eq!(contracts_for(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_quantization_bound() {
        let sizes = [dec!(0.0001), dec!(0.01), dec!(1), dec!(10), dec!(100)];
        let quantities = [
            dec!(0.00017),
            dec!(0.37),
            dec!(1),
            dec!(7.5),
            dec!(49.99),
            dec!(123.456),
            dec!(1000.5),
        ];

        for cs in sizes {
            for qty in quantities {
                let exact = contracts_for(qty, cs) * cs;
                assert!(
                    (exact - qty).abs() < cs,
                    "qty={qty} cs={cs} exact={exact}"
                );
            }
        }
    }
}
