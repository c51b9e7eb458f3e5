//! Business logic for request dispatch.
//!
//! - [`dispatcher`]: routing snapshot, selection, retry cursor, failure
//!   classification
//! - [`strategy`]: named model-selection strategies
//! - [`key_health`]: in-memory credential health store
//! - [`secret`]: credential encryption at rest

pub mod dispatcher;
pub mod key_health;
pub mod secret;
pub mod strategy;

pub use dispatcher::{
    classify_status, classify_transport, max_attempts_for, Attempt, DispatchPlan, Dispatcher,
    FailureClass, GroupState, ModelEndpoint, ProviderFamily, RetryCursor, Routing,
    RoutingSnapshot,
};
pub use key_health::KeyHealthStore;
pub use secret::{AesGcmSecretProvider, NoopSecretProvider, SecretProvider};
pub use strategy::{FallbackStrategy, RoundRobinStrategy, Strategy, StrategyRegistry};
