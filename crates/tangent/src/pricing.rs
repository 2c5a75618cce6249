//! Per-model unit prices used to derive the estimated cost of a response.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Usage;

/// Unit prices for a single model, in USD per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price of 1000 prompt tokens.
    pub prompt_per_1k: f64,
    /// Price of 1000 completion tokens.
    pub completion_per_1k: f64,
}

impl ModelPricing {
    pub fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }

    /// Cost of a request with the given token counts.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_per_1k
    }

    /// Cost of the request(s) accounted for by `usage`.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        self.cost(usage.prompt_tokens, usage.completion_tokens)
    }
}

/// A price table keyed by model name.
#[derive(Debug, Clone, Default)]
pub struct PricingRegistry {
    prices: HashMap<String, ModelPricing>,
}

impl PricingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) -> &mut Self {
        self.prices.insert(model.into(), pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        self.prices.get(model).copied()
    }
}
