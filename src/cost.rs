//! Cost Calculator
//!
//! Pure arithmetic: combine a token-usage record with a pricing record into a
//! USD amount. All math is fixed-point decimal; prices are per million
//! tokens and the result is quantized to 6 decimal places.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::pricing::ModelDescriptor;
use crate::tokens::Usage;

const MTOK: Decimal = dec!(1000000);

/// Cost of `usage` under `descriptor`, quantized to 6 decimal places.
///
/// Zero-price fields (providers without prompt caching) contribute zero.
pub fn calculate_cost(usage: &Usage, descriptor: &ModelDescriptor) -> Decimal {
    let cost = (Decimal::from(usage.input_tokens) * descriptor.input_per_mtok
        + Decimal::from(usage.output_tokens) * descriptor.output_per_mtok
        + Decimal::from(usage.cache_creation_tokens) * descriptor.cache_create_per_mtok
        + Decimal::from(usage.cache_read_tokens) * descriptor.cache_read_per_mtok)
        / MTOK;

    cost.round_dp(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn descriptor(input: Decimal, output: Decimal, cc: Decimal, cr: Decimal) -> ModelDescriptor {
        ModelDescriptor {
            provider: "anthropic".into(),
            model: "claude-sonnet-4-5".into(),
            input_per_mtok: input,
            output_per_mtok: output,
            cache_create_per_mtok: cc,
            cache_read_per_mtok: cr,
            effective_from: DateTime::<Utc>::MIN_UTC,
            effective_to: None,
            synthetic: false,
        }
    }

    #[test]
    fn sonnet_unary_example() {
        // 1000 input at $3/MTok + 500 output at $15/MTok = $0.0105
        let d = descriptor(dec!(3.00), dec!(15.00), dec!(3.75), dec!(0.30));
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 500,
            ..Usage::default()
        };
        assert_eq!(calculate_cost(&usage, &d), dec!(0.0105));
    }

    #[test]
    fn cache_tokens_are_billed_at_their_own_rates() {
        let d = descriptor(dec!(3.00), dec!(15.00), dec!(3.75), dec!(0.30));
        let usage = Usage {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 1_000_000,
            cache_read_tokens: 1_000_000,
        };
        assert_eq!(calculate_cost(&usage, &d), dec!(4.05));
    }

    #[test]
    fn zero_price_cache_fields_contribute_zero() {
        let d = descriptor(dec!(2.50), dec!(10.00), Decimal::ZERO, Decimal::ZERO);
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 100,
            cache_creation_tokens: 50_000,
            cache_read_tokens: 50_000,
        };
        assert_eq!(calculate_cost(&usage, &d), dec!(0.00125));
    }

    #[test]
    fn associative_under_usage_splitting() {
        let d = descriptor(dec!(3.00), dec!(15.00), dec!(3.75), dec!(0.30));
        let u1 = Usage {
            input_tokens: 123,
            output_tokens: 456,
            cache_creation_tokens: 7,
            cache_read_tokens: 89,
        };
        let u2 = Usage {
            input_tokens: 1000,
            output_tokens: 1,
            cache_creation_tokens: 0,
            cache_read_tokens: 11,
        };
        let merged = Usage {
            input_tokens: u1.input_tokens + u2.input_tokens,
            output_tokens: u1.output_tokens + u2.output_tokens,
            cache_creation_tokens: u1.cache_creation_tokens + u2.cache_creation_tokens,
            cache_read_tokens: u1.cache_read_tokens + u2.cache_read_tokens,
        };
        assert_eq!(
            calculate_cost(&merged, &d),
            calculate_cost(&u1, &d) + calculate_cost(&u2, &d)
        );
    }

    #[test]
    fn zero_usage_costs_nothing() {
        let d = descriptor(dec!(15.00), dec!(75.00), dec!(18.75), dec!(1.50));
        assert_eq!(calculate_cost(&Usage::default(), &d), Decimal::ZERO);
    }
}
