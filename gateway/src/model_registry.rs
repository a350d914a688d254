use std::collections::{HashMap, HashSet};
use std::env;

/// How the gateway authenticates to an upstream model service.
#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    ApiKey { header: String, key: String },
    Bearer { token: String },
    Custom { header: String, value: String },
}

/// Immutable description of one upstream model. At most one record per id.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub health_path: String,
    pub capabilities: HashSet<String>,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub input_token_price: f64,
    pub output_token_price: f64,
    pub auth: UpstreamAuth,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelConfig>,
    /// Model used when a completion request names none.
    pub default_model: String,
    /// Model backing `/v1/code/analysis`.
    pub coder_model: String,
    /// Model backing `/v1/security/scan`.
    pub redteam_model: String,
}

impl ModelRegistry {
    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.models.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Build the fleet from env-overridable endpoints. Base URLs come from
    /// `MODEL_<ID>_URL`, upstream credentials from `MODEL_<ID>_API_KEY`.
    pub fn from_env() -> Self {
        let mut models = HashMap::new();

        let qwen_42b = ModelConfig {
            id: "qwen3_42b".to_string(),
            display_name: "Qwen3 42B".to_string(),
            base_url: env_url("MODEL_QWEN3_42B_URL", "http://localhost:8001"),
            health_path: "/health".to_string(),
            capabilities: caps(&["completion", "chat"]),
            context_window: 32_768,
            max_output_tokens: 8_192,
            input_token_price: 0.000_001,
            output_token_price: 0.000_002,
            auth: UpstreamAuth::ApiKey {
                header: "X-API-Key".to_string(),
                key: env::var("MODEL_QWEN3_42B_API_KEY").unwrap_or_default(),
            },
        };
        models.insert(qwen_42b.id.clone(), qwen_42b);

        let qwen_coder = ModelConfig {
            id: "qwen3_moe_coder".to_string(),
            display_name: "Qwen3 MoE Coder".to_string(),
            base_url: env_url("MODEL_QWEN3_MOE_CODER_URL", "http://localhost:8002"),
            health_path: "/health".to_string(),
            capabilities: caps(&["completion", "chat", "code"]),
            context_window: 65_536,
            max_output_tokens: 16_384,
            input_token_price: 0.000_002,
            output_token_price: 0.000_004,
            auth: UpstreamAuth::Bearer {
                token: env::var("MODEL_QWEN3_MOE_CODER_API_KEY").unwrap_or_default(),
            },
        };
        models.insert(qwen_coder.id.clone(), qwen_coder);

        let qwen_moe = ModelConfig {
            id: "qwen3_moe".to_string(),
            display_name: "Qwen3 MoE Red Team".to_string(),
            base_url: env_url("MODEL_QWEN3_MOE_URL", "http://localhost:8003"),
            health_path: "/health".to_string(),
            capabilities: caps(&["completion", "chat", "security"]),
            context_window: 65_536,
            max_output_tokens: 16_384,
            input_token_price: 0.000_002,
            output_token_price: 0.000_004,
            auth: UpstreamAuth::Custom {
                header: "X-Internal-Auth".to_string(),
                value: env::var("MODEL_QWEN3_MOE_API_KEY").unwrap_or_default(),
            },
        };
        models.insert(qwen_moe.id.clone(), qwen_moe);

        Self {
            models,
            default_model: "qwen3_42b".to_string(),
            coder_model: "qwen3_moe_coder".to_string(),
            redteam_model: "qwen3_moe".to_string(),
        }
    }

    /// Registry with every model pointed at one base URL; used by tests that
    /// stand up a single fake upstream.
    pub fn with_base_url(base_url: &str) -> Self {
        let mut registry = Self::from_env();
        for model in registry.models.values_mut() {
            model.base_url = base_url.trim_end_matches('/').to_string();
        }
        registry
    }
}

fn env_url(var: &str, default: &str) -> String {
    env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn caps(values: &[&str]) -> HashSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}
