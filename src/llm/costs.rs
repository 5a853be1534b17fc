//! Per-token pricing for known models.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token. Unknown models fall back to a
/// mid-tier estimate so cost logs never read zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let m = model.to_ascii_lowercase();
    if m.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if m.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if m.contains("sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if m.contains("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if m.contains("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else {
        (dec!(0.000003), dec!(0.000015))
    }
}

/// Cost of a single call in USD.
pub fn call_cost(model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
    let (input, output) = model_cost(model);
    input * Decimal::from(input_tokens) + output * Decimal::from(output_tokens)
}
