//! Shared cost ledger for model calls.
//!
//! One [`BudgetLedger`] is constructed per task run and handed to every
//! model wrapper and child agent as an `Arc`. The check and the record step
//! each take the same lock, so concurrent agents never lose an update.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::obs;

/// Pricing used for models that were never registered.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_1m: 0.30,
    output_per_1m: 2.50,
};

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// Accumulated usage for one registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub pricing: ModelPricing,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl ModelUsage {
    fn new(pricing: ModelPricing) -> Self {
        Self {
            pricing,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
        }
    }
}

/// Raised by [`BudgetLedger::check`] once spending reaches the ceiling.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Budget exceeded! Current cost: ${current:.6}, Limit: ${limit:.6}")]
pub struct BudgetExceeded {
    pub current: f64,
    pub limit: f64,
}

/// Point-in-time copy of the ledger totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_usd: f64,
    pub current_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub models: IndexMap<String, ModelUsage>,
}

#[derive(Debug, Default)]
struct LedgerState {
    current_cost: f64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    models: IndexMap<String, ModelUsage>,
}

#[derive(Debug)]
pub struct BudgetLedger {
    max_usd: f64,
    state: Mutex<LedgerState>,
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl BudgetLedger {
    pub fn new(max_usd: f64) -> Self {
        Self {
            max_usd,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn max_usd(&self) -> f64 {
        self.max_usd
    }

    /// Registers (or re-prices) a model. Existing totals are kept.
    pub fn register_model(&self, model_id: &str, pricing: ModelPricing) {
        let mut state = self.state.lock();
        state
            .models
            .entry(model_id.to_string())
            .and_modify(|usage| usage.pricing = pricing)
            .or_insert_with(|| ModelUsage::new(pricing));
    }

    /// Records token usage and returns the cost charged for it.
    ///
    /// Unregistered models are charged at [`DEFAULT_PRICING`] and only count
    /// toward the totals.
    pub fn add_usage(&self, input_tokens: u64, output_tokens: u64, model_id: Option<&str>) -> f64 {
        let mut state = self.state.lock();
        let usage = model_id.and_then(|id| state.models.get_mut(id));
        let cost = match usage {
            Some(usage) => {
                let cost = usage.pricing.cost(input_tokens, output_tokens);
                usage.input_tokens += input_tokens;
                usage.output_tokens += output_tokens;
                usage.cost += cost;
                cost
            }
            None => DEFAULT_PRICING.cost(input_tokens, output_tokens),
        };
        state.total_input_tokens += input_tokens;
        state.total_output_tokens += output_tokens;
        state.current_cost += cost;
        tracing::debug!(
            model = model_id.unwrap_or("default"),
            input_tokens,
            output_tokens,
            cost,
            "usage recorded"
        );
        cost
    }

    /// Fails once the accumulated cost has reached the ceiling.
    pub fn check(&self) -> Result<(), BudgetExceeded> {
        let current = self.state.lock().current_cost;
        if current >= self.max_usd {
            obs::emit_budget_exceeded(current, self.max_usd);
            return Err(BudgetExceeded {
                current,
                limit: self.max_usd,
            });
        }
        Ok(())
    }

    pub fn current_cost(&self) -> f64 {
        self.state.lock().current_cost
    }

    pub fn remaining(&self) -> f64 {
        (self.max_usd - self.current_cost()).max(0.0)
    }

    /// Cost per registered model.
    pub fn breakdown(&self) -> IndexMap<String, f64> {
        self.state
            .lock()
            .models
            .iter()
            .map(|(id, usage)| (id.clone(), usage.cost))
            .collect()
    }

    pub fn model_stats(&self, model_id: &str) -> Option<ModelUsage> {
        self.state.lock().models.get(model_id).cloned()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.state.lock();
        BudgetSnapshot {
            max_usd: self.max_usd,
            current_cost: state.current_cost,
            total_input_tokens: state.total_input_tokens,
            total_output_tokens: state.total_output_tokens,
            models: state.models.clone(),
        }
    }

    /// Clears totals and registered models.
    pub fn reset(&self) {
        *self.state.lock() = LedgerState::default();
    }
}

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_registered_model_pricing() {
        let ledger = BudgetLedger::new(10.0);
        ledger.register_model(
            "m",
            ModelPricing {
                input_per_1m: 1.0,
                output_per_1m: 2.0,
            },
        );
        let cost = ledger.add_usage(1_000_000, 500_000, Some("m"));
        assert!((cost - 2.0).abs() < 1e-9);
        let stats = ledger.model_stats("m").unwrap();
        assert_eq!(stats.input_tokens, 1_000_000);
        assert!((ledger.breakdown()["m"] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_unregistered_model_uses_default_pricing() {
        let ledger = BudgetLedger::new(10.0);
        ledger.add_usage(1_000_000, 0, Some("unknown"));
        assert!((ledger.current_cost() - 0.30).abs() < 1e-9);
        assert!(ledger.breakdown().is_empty());
    }

    #[test]
    fn test_check_fails_at_ceiling() {
        let ledger = BudgetLedger::new(0.5);
        assert!(ledger.check().is_ok());
        ledger.add_usage(0, 200_000, None);
        let err = ledger.check().unwrap_err();
        assert_eq!(err.limit, 0.5);
        assert!(err.to_string().starts_with("Budget exceeded! Current cost: $0.500000"));
    }

    #[test]
    fn test_concurrent_recording_is_exact() {
        let ledger = Arc::new(BudgetLedger::new(100.0));
        ledger.register_model(
            "m",
            ModelPricing {
                input_per_1m: 3.0,
                output_per_1m: 0.0,
            },
        );
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.add_usage(1000, 0, Some("m"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.total_input_tokens, 1_600_000);
        assert!((snapshot.current_cost - 4.8).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_serializes_models_in_order() {
        let ledger = BudgetLedger::new(1.0);
        ledger.register_model("b-model", DEFAULT_PRICING);
        ledger.register_model("a-model", DEFAULT_PRICING);
        ledger.add_usage(10, 5, Some("b-model"));
        ledger.add_usage(10, 5, Some("a-model"));
        let json = serde_json::to_value(ledger.snapshot()).unwrap();
        let names: Vec<_> = json["models"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(names, ["b-model", "a-model"]);
        let back: BudgetSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_input_tokens, 20);
        assert_eq!(back.models.len(), 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let ledger = BudgetLedger::default();
        ledger.register_model("m", DEFAULT_PRICING);
        ledger.add_usage(10, 10, Some("m"));
        ledger.reset();
        assert_eq!(ledger.current_cost(), 0.0);
        assert!(ledger.model_stats("m").is_none());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abc"), 0);
    }
}
