//! Model pricing table.
//!
//! Rates are USD per million tokens and form a closed mapping: unknown
//! model names always resolve to the `default` entry, never to an invented
//! key.

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenRate {
    pub input: f64,
    pub output: f64,
}

pub const DEFAULT_MODEL_KEY: &str = "default";

const RATE_TABLE: &[(&str, TokenRate)] = &[
    ("claude-opus-4", TokenRate { input: 15.0, output: 75.0 }),
    ("claude-sonnet-4", TokenRate { input: 3.0, output: 15.0 }),
    ("claude-3-5-sonnet", TokenRate { input: 3.0, output: 15.0 }),
    ("claude-3-5-haiku", TokenRate { input: 0.8, output: 4.0 }),
    ("gpt-4o", TokenRate { input: 2.5, output: 10.0 }),
    ("gpt-4o-mini", TokenRate { input: 0.15, output: 0.6 }),
    ("o3", TokenRate { input: 2.0, output: 8.0 }),
    ("gemini-2.5-pro", TokenRate { input: 1.25, output: 10.0 }),
    ("gemini-2.5-flash", TokenRate { input: 0.3, output: 2.5 }),
    (DEFAULT_MODEL_KEY, TokenRate { input: 3.0, output: 15.0 }),
];

/// Rate for a model name, falling back to the default entry.
pub fn rate_for(model: &str) -> TokenRate {
    RATE_TABLE
        .iter()
        .find(|(name, _)| *name == model)
        .or_else(|| RATE_TABLE.iter().find(|(name, _)| *name == DEFAULT_MODEL_KEY))
        .map(|(_, rate)| *rate)
        .expect("rate table declares a default entry")
}

/// Estimated USD cost for a usage record's token counts.
pub fn calculate_cost(input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
    let rate = rate_for(model);
    (input_tokens as f64 / 1_000_000.0) * rate.input
        + (output_tokens as f64 / 1_000_000.0) * rate.output
}
