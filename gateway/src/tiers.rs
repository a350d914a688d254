use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Admission and pricing class assigned to a principal. Unknown tier names
/// fail closed at lookup time; there is no fallback tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Free,
    Professional,
    Enterprise,
    Internal,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
            Self::Internal => "internal",
        }
    }

    /// Human-readable marker embedded in API-key secrets for this tier.
    pub fn key_marker(&self) -> &'static str {
        match self {
            Self::Free => "test",
            Self::Professional => "pro",
            Self::Enterprise => "ent",
            Self::Internal => "int",
        }
    }
}

impl FromStr for TierName {
    type Err = UnknownTier;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "free" => Ok(Self::Free),
            "professional" => Ok(Self::Professional),
            "enterprise" => Ok(Self::Enterprise),
            "internal" => Ok(Self::Internal),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tier '{0}'")]
pub struct UnknownTier(pub String);

/// Static per-tier admission limits and pricing. Loaded once at startup and
/// shared read-only across every request.
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub name: TierName,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub concurrent_requests: u32,
    pub max_tokens_per_request: u32,
    pub max_context_window: u32,
    /// Allowed model ids; `*` grants all.
    pub allowed_models: HashSet<String>,
    /// Allowed endpoint tokens; `*` grants all.
    pub allowed_endpoints: HashSet<String>,
    pub priority: u8,
    pub monthly_price: f64,
    pub input_token_price: f64,
    pub output_token_price: f64,
}

impl TierConfig {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.contains("*") || self.allowed_models.contains(model)
    }

    pub fn allows_endpoint(&self, endpoint: &str) -> bool {
        self.allowed_endpoints.contains("*") || self.allowed_endpoints.contains(endpoint)
    }
}

#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: HashMap<TierName, TierConfig>,
}

impl TierTable {
    pub fn get(&self, name: TierName) -> Option<&TierConfig> {
        self.tiers.get(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierConfig> {
        self.tiers.values()
    }
}

fn set(values: &[&str]) -> HashSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl Default for TierTable {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            TierName::Free,
            TierConfig {
                name: TierName::Free,
                requests_per_hour: 1_000,
                requests_per_day: 5_000,
                concurrent_requests: 2,
                max_tokens_per_request: 1_024,
                max_context_window: 8_192,
                allowed_models: set(&["qwen3_42b"]),
                allowed_endpoints: set(&["models", "completions", "chat.completions", "usage"]),
                priority: 0,
                monthly_price: 0.0,
                input_token_price: 0.0,
                output_token_price: 0.0,
            },
        );
        tiers.insert(
            TierName::Professional,
            TierConfig {
                name: TierName::Professional,
                requests_per_hour: 10_000,
                requests_per_day: 100_000,
                concurrent_requests: 10,
                max_tokens_per_request: 4_096,
                max_context_window: 32_768,
                allowed_models: set(&["qwen3_42b", "qwen3_moe_coder"]),
                allowed_endpoints: set(&[
                    "models",
                    "completions",
                    "chat.completions",
                    "code.analysis",
                    "usage",
                ]),
                priority: 1,
                monthly_price: 49.0,
                input_token_price: 0.000_002,
                output_token_price: 0.000_004,
            },
        );
        tiers.insert(
            TierName::Enterprise,
            TierConfig {
                name: TierName::Enterprise,
                requests_per_hour: 100_000,
                requests_per_day: 1_000_000,
                concurrent_requests: 50,
                max_tokens_per_request: 8_192,
                max_context_window: 131_072,
                allowed_models: set(&["*"]),
                allowed_endpoints: set(&["*"]),
                priority: 2,
                monthly_price: 499.0,
                input_token_price: 0.000_001_5,
                output_token_price: 0.000_003,
            },
        );
        tiers.insert(
            TierName::Internal,
            TierConfig {
                name: TierName::Internal,
                requests_per_hour: 1_000_000,
                requests_per_day: 10_000_000,
                concurrent_requests: 200,
                max_tokens_per_request: 32_768,
                max_context_window: 131_072,
                allowed_models: set(&["*"]),
                allowed_endpoints: set(&["*"]),
                priority: 3,
                monthly_price: 0.0,
                input_token_price: 0.0,
                output_token_price: 0.0,
            },
        );
        Self { tiers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_models_cover_everything() {
        let table = TierTable::default();
        let enterprise = table.get(TierName::Enterprise).unwrap();
        assert!(enterprise.allows_model("qwen3_moe"));
        assert!(enterprise.allows_endpoint("security.scan"));
    }

    #[test]
    fn free_tier_is_restricted() {
        let table = TierTable::default();
        let free = table.get(TierName::Free).unwrap();
        assert!(free.allows_model("qwen3_42b"));
        assert!(!free.allows_model("qwen3_moe"));
        assert!(!free.allows_endpoint("security.scan"));
    }

    #[test]
    fn tier_names_roundtrip() {
        for name in ["free", "professional", "enterprise", "internal"] {
            assert_eq!(name.parse::<TierName>().unwrap().as_str(), name);
        }
        assert!("platinum".parse::<TierName>().is_err());
    }
}
