//! Static price table for cost estimation
//!
//! Rates are USD per 1000 tokens, keyed by (provider, model). Models absent
//! from the table are billed at the fallback rate; this is an estimate for
//! quota enforcement and billing audit, not an invoice.

/// Per-1k-token USD rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Rate applied to models the table does not know.
pub const FALLBACK_PRICE: ModelPrice = ModelPrice {
    input_per_1k: 0.002,
    output_per_1k: 0.008,
};

const PRICES: &[(&str, &str, ModelPrice)] = &[
    (
        "openai",
        "gpt-4o",
        ModelPrice { input_per_1k: 0.0025, output_per_1k: 0.01 },
    ),
    (
        "openai",
        "gpt-4o-mini",
        ModelPrice { input_per_1k: 0.00015, output_per_1k: 0.0006 },
    ),
    (
        "openai",
        "gpt-4.1",
        ModelPrice { input_per_1k: 0.002, output_per_1k: 0.008 },
    ),
    (
        "openai",
        "gpt-4.1-mini",
        ModelPrice { input_per_1k: 0.0004, output_per_1k: 0.0016 },
    ),
    (
        "anthropic",
        "claude-3-5-haiku-latest",
        ModelPrice { input_per_1k: 0.0008, output_per_1k: 0.004 },
    ),
    (
        "anthropic",
        "claude-sonnet-4-20250514",
        ModelPrice { input_per_1k: 0.003, output_per_1k: 0.015 },
    ),
    (
        "anthropic",
        "claude-opus-4-20250514",
        ModelPrice { input_per_1k: 0.015, output_per_1k: 0.075 },
    ),
];

pub fn price_for(provider: &str, model: &str) -> ModelPrice {
    PRICES
        .iter()
        .find(|(p, m, _)| *p == provider && *m == model)
        .map(|(_, _, price)| *price)
        .unwrap_or(FALLBACK_PRICE)
}

/// Estimated cost of a completed request in USD.
pub fn estimate_cost(provider: &str, model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let price = price_for(provider, model);
    (input_tokens as f64 / 1000.0) * price.input_per_1k
        + (output_tokens as f64 / 1000.0) * price.output_per_1k
}
