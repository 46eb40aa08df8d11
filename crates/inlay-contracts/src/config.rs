use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use indexmap::IndexMap;
use serde::Deserialize;

/// Environment variable consulted for remote generation credentials when no
/// explicit key is passed.
pub const REMOTE_CREDENTIAL_ENV: &str = "BFL_API_KEY";

/// Environment variable consulted for vision credentials.
pub const VISION_CREDENTIAL_ENV: &str = "DASHSCOPE_API_KEY";

const DEFAULT_REMOTE_API_BASE: &str = "https://api.bfl.ai/v1";

/// Recognized configuration, loaded from a JSON file. Unknown remote keys
/// are allowed; the two built-in model classes map to `pro` and `max`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub models: LocalModels,
    #[serde(default)]
    pub api_models: IndexMap<String, ApiModelConfig>,
}

/// Local pipeline weight locations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalModels {
    pub text_to_image: Option<PathBuf>,
    pub image_to_image: Option<PathBuf>,
    /// Template with a `{precision}` placeholder, e.g.
    /// `.../svdq-{precision}_r32-flux.1-dev.safetensors`.
    pub nunchaku_transformer: Option<String>,
}

impl LocalModels {
    pub fn nunchaku_path(&self, precision: &str) -> Option<PathBuf> {
        self.nunchaku_transformer
            .as_ref()
            .map(|template| PathBuf::from(template.replace("{precision}", precision)))
    }
}

/// One remote provider endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiModelConfig {
    pub api_base: String,
    pub endpoint: String,
    pub model_name: String,
}

impl ApiModelConfig {
    pub fn submit_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config.with_defaults())
    }

    /// Fill in the built-in `pro`/`max` remote entries when the file (or an
    /// empty default config) does not define them.
    pub fn with_defaults(mut self) -> Self {
        for (key, endpoint) in [("pro", "flux-kontext-pro"), ("max", "flux-kontext-max")] {
            self.api_models
                .entry(key.to_string())
                .or_insert_with(|| ApiModelConfig {
                    api_base: DEFAULT_REMOTE_API_BASE.to_string(),
                    endpoint: endpoint.to_string(),
                    model_name: endpoint.to_string(),
                });
        }
        self
    }

    pub fn api_model(&self, key: &str) -> Option<&ApiModelConfig> {
        self.api_models.get(key)
    }
}

/// Resolve a credential: explicit parameter wins, then the provider's
/// environment variable. Blank values count as absent.
pub fn resolve_credential(explicit: Option<&str>, env_key: &str) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            env::var(env_key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}
