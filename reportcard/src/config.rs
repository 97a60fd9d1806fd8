//! Process configuration loaded from the environment.
//!
//! Every problem is collected before failing so a misconfigured deployment
//! reports all missing or malformed keys in one go.

use std::path::PathBuf;

use base64::Engine;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Wallet / indexer settings; present only when a payment wallet is configured.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentConfig {
    pub wallet_address: String,
    pub amount: f64,
    pub server_url: Option<String>,
    pub network: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub port: u16,
    /// Journal database file
    pub database_url: String,

    pub storage_bucket: String,
    /// Directory buckets live under
    pub storage_root: PathBuf,
    /// Base URL stored objects are served from
    pub public_base_url: String,

    pub google_api_key: String,
    pub gemini_model: String,

    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_base_url: String,

    pub image_format: String,
    pub image_width: u32,
    pub image_height: u32,

    pub payment: Option<PaymentConfig>,

    pub research_agent_prompt: String,
    pub content_generation_prompt: String,
    pub poll_parser_prompt: String,

    pub github_token: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Env {
            lookup: |key: &str| lookup(key).filter(|v| !v.is_empty()),
            errors: Vec::new(),
        };

        let port = env.parsed("PORT", 8080u16);
        let database_url = env.optional("DATABASE_URL", "./data/events.db");
        let storage_bucket = env.required("STORAGE_BUCKET");
        let storage_root = PathBuf::from(env.optional("STORAGE_ROOT", "./data/storage"));
        let public_base_url = env
            .get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}/storage"));

        let google_api_key = env.required("GOOGLE_API_KEY");
        let gemini_model = env.required("GEMINI_MODEL");

        let llm_api_key = env.required("RESEARCH_ORCHESTRATOR_LLM_API_KEY");
        let llm_model = env.required("RESEARCH_ORCHESTRATOR_LLM_MODEL");
        let llm_base_url = env.required("RESEARCH_ORCHESTRATOR_LLM_BASE_URL");

        let image_format = env.required("IMAGE_FORMAT");
        let image_width = env.required_int("IMAGE_WIDTH");
        let image_height = env.required_int("IMAGE_HEIGHT");

        let network = env.optional("SOLANA_NETWORK", "mainnet");
        let amount = env.parsed("PAYMENT_AMOUNT", 0.01f64);
        let server_url = env.get("FOROHTOO_SERVER_URL");
        let payment = env.get("PAYMENT_WALLET_ADDRESS").map(|wallet_address| PaymentConfig {
            wallet_address,
            amount,
            server_url,
            network,
        });

        let research_agent_prompt = env.required_base64("RESEARCH_AGENT_SYSTEM_PROMPT");
        let content_generation_prompt = env.required_base64("CONTENT_GENERATION_SYSTEM_PROMPT");
        let poll_parser_prompt = env.required_base64("POLL_PARSER_SYSTEM_PROMPT");

        let github_token = env.get("GH_TOKEN");

        if !env.errors.is_empty() {
            return Err(ConfigError::Invalid(env.errors));
        }

        Ok(Self {
            port,
            database_url,
            storage_bucket,
            storage_root,
            public_base_url,
            google_api_key,
            gemini_model,
            llm_api_key,
            llm_model,
            llm_base_url,
            image_format,
            image_width,
            image_height,
            payment,
            research_agent_prompt,
            content_generation_prompt,
            poll_parser_prompt,
            github_token,
        })
    }
}

struct Env<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn optional(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&mut self, key: &str) -> String {
        match self.get(key) {
            Some(value) => value,
            None => {
                self.errors.push(format!("{key} is required"));
                String::new()
            }
        }
    }

    fn required_int(&mut self, key: &str) -> u32 {
        let Some(raw) = self.get(key) else {
            self.errors.push(format!("{key} is required"));
            return 0;
        };
        match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                self.errors
                    .push(format!("{key} must be a valid integer: {e}"));
                0
            }
        }
    }

    fn parsed<T: std::str::FromStr>(&mut self, key: &str, default: T) -> T
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => match raw.trim().parse() {
                Ok(value) => value,
                Err(e) => {
                    self.errors.push(format!("{key} is invalid: {e}"));
                    default
                }
            },
            None => default,
        }
    }

    fn required_base64(&mut self, key: &str) -> String {
        let raw = self.required(key);
        if raw.is_empty() {
            return raw;
        }
        match base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| e.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()))
        {
            Ok(decoded) => decoded,
            Err(e) => {
                self.errors.push(format!("{key} must be valid base64: {e}"));
                String::new()
            }
        }
    }
}

/// Load `.env` from the current directory or the nearest ancestor that has one.
pub fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    for dir in cwd.ancestors() {
        let candidate = dir.join(".env");
        if !candidate.exists() {
            continue;
        }
        match dotenvy::from_path(&candidate) {
            Ok(()) => tracing::info!(path = %candidate.display(), "Loaded environment from .env"),
            Err(e) => tracing::warn!(
                path = %candidate.display(),
                error = %e,
                "Failed to load .env file"
            ),
        }
        return;
    }

    tracing::info!(
        cwd = %cwd.display(),
        "No .env file found in current directory or ancestors; using process environment only"
    );
}
