//! Model-selection strategies.
//!
//! A strategy is a pure function from the group's ordered model list and its
//! per-request counter to a starting model index. Strategies are registered
//! by name at startup; new ones (weighted, latency-aware) plug in without
//! touching the dispatcher.

use std::collections::HashMap;

use crate::core::error::AppError;
use crate::services::dispatcher::ModelEndpoint;

/// Name of the strategy used when a group names an unknown one.
pub const DEFAULT_STRATEGY: &str = "round_robin";

/// A model-selection strategy. Fails only when the model list is empty.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick the starting model index for this routing call.
    fn select(&self, models: &[ModelEndpoint], counter: u64) -> Result<usize, AppError>;
}

/// Even rotation: `(counter - 1) % len`. The dispatcher increments the
/// counter once per routing call, so consecutive calls walk the list.
pub struct RoundRobinStrategy;

impl Strategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, models: &[ModelEndpoint], counter: u64) -> Result<usize, AppError> {
        if models.is_empty() {
            return Err(AppError::Internal("no models available in group".into()));
        }
        Ok(((counter.wrapping_sub(1)) % models.len() as u64) as usize)
    }
}

/// Priority order: always the first model. The dispatcher's retry loop
/// advances past it when it fails.
pub struct FallbackStrategy;

impl Strategy for FallbackStrategy {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn select(&self, models: &[ModelEndpoint], _counter: u64) -> Result<usize, AppError> {
        if models.is_empty() {
            return Err(AppError::Internal("no models available in group".into()));
        }
        Ok(0)
    }
}

/// Registry of named strategies, populated at startup.
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Box<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Registry with the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Box::new(RoundRobinStrategy));
        registry.register(Box::new(FallbackStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        self.strategies.insert(strategy.name(), strategy);
    }

    /// Resolve a strategy by name; unknown names fall back to round-robin
    /// with a warning.
    pub fn resolve(&self, name: &str) -> &dyn Strategy {
        if let Some(strategy) = self.strategies.get(name) {
            return strategy.as_ref();
        }
        tracing::warn!(strategy = name, "unknown strategy, falling back to round_robin");
        self.strategies
            .get(DEFAULT_STRATEGY)
            .expect("round_robin is always registered")
            .as_ref()
    }
}
