//! Model pricing definitions for pending-cost estimates.
//!
//! Prices can be customized via environment variables or programmatically.
//! Actual spend always comes from the upstream executor; these prices only
//! estimate what a queued query is likely to cost before it is dispatched.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Rough characters-per-token ratio used for estimates.
const CHARS_PER_TOKEN: usize = 4;
const TOKENS_PER_MTOK: Decimal = dec!(1_000_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
}

impl ModelPricing {
    pub const fn new(input_per_mtok: Decimal, output_per_mtok: Decimal) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn calculate(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let input = Decimal::from(input_tokens) / TOKENS_PER_MTOK * self.input_per_mtok;
        let output = Decimal::from(output_tokens) / TOKENS_PER_MTOK * self.output_per_mtok;
        input + output
    }
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
    default: ModelPricing,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::new()
    }

    /// Exact name first, then the first registered name the model contains
    /// (so `acme-large-2025-01` matches an entry named `large`).
    pub fn get(&self, model: &str) -> &ModelPricing {
        let normalized = model.to_lowercase();
        if let Some(pricing) = self.models.get(&normalized) {
            return pricing;
        }
        let mut families: Vec<(&String, &ModelPricing)> = self
            .models
            .iter()
            .filter(|(name, _)| normalized.contains(name.as_str()))
            .collect();
        // Longest family name wins so "large-v2" beats "large".
        families.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
        families
            .first()
            .map(|(_, pricing)| *pricing)
            .unwrap_or(&self.default)
    }

    pub fn calculate(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Decimal {
        self.get(model).calculate(input_tokens, output_tokens)
    }

    /// Estimate the cost of answering `text` with up to `max_output_tokens`.
    pub fn estimate(&self, model: &str, text: &str, max_output_tokens: u64) -> Decimal {
        self.calculate(model, estimate_tokens(text), max_output_tokens)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        PricingTableBuilder::new().with_defaults().build()
    }
}

/// Character-count token estimate. Never zero for non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    models: HashMap<String, ModelPricing>,
    default: Option<ModelPricing>,
}

impl PricingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generic three-tier price list.
    pub fn with_defaults(mut self) -> Self {
        self.models
            .insert("large".into(), ModelPricing::new(dec!(15), dec!(75)));
        self.models
            .insert("medium".into(), ModelPricing::new(dec!(3), dec!(15)));
        self.models
            .insert("small".into(), ModelPricing::new(dec!(0.80), dec!(4)));
        self
    }

    pub fn model(mut self, name: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(name.into().to_lowercase(), pricing);
        self
    }

    pub fn models(mut self, models: impl IntoIterator<Item = (String, ModelPricing)>) -> Self {
        for (name, pricing) in models {
            self.models.insert(name.to_lowercase(), pricing);
        }
        self
    }

    pub fn default_pricing(mut self, pricing: ModelPricing) -> Self {
        self.default = Some(pricing);
        self
    }

    /// Defaults, then `GOVERNOR_PRICING_<MODEL>_INPUT` / `_OUTPUT` overrides for
    /// every registered model.
    pub fn from_env(mut self) -> Self {
        self = self.with_defaults();
        let names: Vec<String> = self.models.keys().cloned().collect();
        for name in names {
            if let Some(pricing) = Self::parse_env_pricing(&name) {
                self.models.insert(name, pricing);
            }
        }
        self
    }

    fn parse_env_pricing(model: &str) -> Option<ModelPricing> {
        let key = model.to_uppercase().replace(['-', '.'], "_");
        let input = std::env::var(format!("GOVERNOR_PRICING_{}_INPUT", key))
            .ok()?
            .parse::<Decimal>()
            .ok()?;
        let output = std::env::var(format!("GOVERNOR_PRICING_{}_OUTPUT", key))
            .ok()?
            .parse::<Decimal>()
            .ok()?;
        Some(ModelPricing::new(input, output))
    }

    pub fn build(self) -> PricingTable {
        let default = self
            .default
            .or_else(|| self.models.get("medium").copied())
            .unwrap_or(ModelPricing::new(dec!(3), dec!(15)));

        PricingTable {
            models: self.models,
            default,
        }
    }
}
