pub mod admission;
pub mod alerts;
pub mod analysis_handlers;
pub mod app;
pub mod app_state;
pub mod authn;
pub mod breaker;
pub mod completion_handlers;
pub mod config;
pub mod context;
pub mod health;
pub mod identity;
pub mod key_handlers;
pub mod metrics;
pub mod model_registry;
pub mod oauth_handlers;
pub mod output_filter;
pub mod pipeline;
pub mod sanitize;
pub mod suspicion;
pub mod system_handlers;
pub mod tiers;
pub mod tokens;
pub mod upstream;
pub mod usage_handlers;

// Re-export key types for tests
pub use crate::app::build_router;
pub use crate::app_state::AppState;
pub use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use crate::config::GatewayConfig;
pub use crate::context::{Principal, RequestContext};
pub use crate::identity::{IdentityStore, MemoryIdentityStore, PgIdentityStore};
pub use crate::metrics::GatewayMetrics;
pub use crate::model_registry::ModelRegistry;
pub use crate::tiers::{TierName, TierTable};
pub use crate::upstream::{CompletionEnvelope, UpstreamClient};
