//! Cost estimation.
//!
//! Both formulas are pure and use fixed-scale decimal arithmetic:
//!
//! - estimate: `base_fee + rate_multiplier * (assumed_max_tokens * output_weight)`
//! - final:    `base_fee + rate_multiplier * (input_tokens * input_weight + output_tokens * output_weight)`
//!
//! The estimate prices every assumed token as an output token, which makes it an upper bound for
//! the common case and sizes the freeze. Results are rounded to [`MONEY_SCALE`] fractional digits,
//! half away from zero.

use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::types::ModelId;

/// Fractional digits kept on every monetary amount
pub const MONEY_SCALE: u32 = 4;

/// Round a monetary amount to the ledger's fixed scale
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Per-model pricing parameters, owned by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingModel {
    pub rate_multiplier: Decimal,
    /// Flat dispatch fee, charged once content has passed screening
    pub base_fee: Decimal,
    pub input_weight: Decimal,
    pub output_weight: Decimal,
    /// Upper bound applied to a caller's `assumed_max_tokens`
    pub max_tokens_per_request: u32,
}

impl PricingModel {
    /// Cap a caller-supplied token budget at this model's per-request limit
    pub fn cap_tokens(&self, assumed_max_tokens: u32) -> u32 {
        assumed_max_tokens.min(self.max_tokens_per_request)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let fields = [
            ("rate_multiplier", self.rate_multiplier),
            ("base_fee", self.base_fee),
            ("input_weight", self.input_weight),
            ("output_weight", self.output_weight),
        ];
        for (name, value) in fields {
            if value.is_sign_negative() {
                return Err(format!("{name} must not be negative (got {value})"));
            }
        }
        if self.max_tokens_per_request == 0 {
            return Err("max_tokens_per_request must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Pre-charge estimate used to size a freeze.
pub fn estimate_cost(pricing: &PricingModel, assumed_max_tokens: u32) -> Decimal {
    let tokens = Decimal::from(assumed_max_tokens);
    let usage = tokens.saturating_mul(pricing.output_weight);
    round_money(pricing.base_fee.saturating_add(pricing.rate_multiplier.saturating_mul(usage)))
}

/// Settlement cost once real token counts are known.
///
/// With zero tokens this is exactly `base_fee`.
pub fn final_cost(pricing: &PricingModel, input_tokens: u64, output_tokens: u64) -> Decimal {
    let input = Decimal::from(input_tokens).saturating_mul(pricing.input_weight);
    let output = Decimal::from(output_tokens).saturating_mul(pricing.output_weight);
    let usage = input.saturating_add(output);
    round_money(pricing.base_fee.saturating_add(pricing.rate_multiplier.saturating_mul(usage)))
}

/// Model pricing reference data, keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct PricingCatalog {
    models: HashMap<ModelId, PricingModel>,
}

impl PricingCatalog {
    pub fn new(models: HashMap<ModelId, PricingModel>) -> Self {
        Self { models }
    }

    pub fn get(&self, model_id: &str) -> Option<&PricingModel> {
        self.models.get(model_id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
