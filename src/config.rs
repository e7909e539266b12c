//! Runtime configuration for genai-relay.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Everything here is fixed at startup and shared read-only by every request.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::genai::types::{HarmBlockThreshold, HarmCategory, SafetySetting};

/// Default system instruction attached to every generation request.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are an Amex India credit card assistant. Reply concisely.";

/// Default host of the GCE / Cloud Run metadata server.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Location `gcloud auth application-default login` writes to.
fn well_known_credentials_path(var: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let config_dir = match var("CLOUDSDK_CONFIG") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(var("HOME")?).join(".config").join("gcloud"),
    };
    Some(config_dir.join("application_default_credentials.json"))
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "genai-relay", about = "Streaming HTTP relay for Vertex AI Gemini")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address. Overrides `server.listen` from the config file.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose (debug) logging.
    #[arg(short, long, alias = "debug")]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Upstream (Vertex AI) configuration.
    pub upstream: UpstreamConfig,

    /// Generation parameters sent with every request.
    pub generation: GenerationSettings,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:5000").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Vertex AI endpoint and credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Google Cloud project id. Falls back to `GOOGLE_CLOUD_PROJECT`.
    pub project: Option<String>,

    /// Vertex AI location.
    pub location: String,

    /// Model identifier.
    pub model: String,

    /// Base URL override. Derived from `location` when unset.
    pub base_url: Option<String>,

    /// Static OAuth2 access token. Falls back to `GOOGLE_ACCESS_TOKEN`.
    pub access_token: Option<String>,

    /// Path to a credentials file (`service_account` or `authorized_user`).
    /// Falls back to `GOOGLE_APPLICATION_CREDENTIALS`, then to the gcloud
    /// application-default credentials file when it exists.
    pub credentials_path: Option<PathBuf>,

    /// Metadata server host used when no token or credentials file is
    /// available. Falls back to `GCE_METADATA_HOST`.
    pub metadata_host: String,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Overall upstream request timeout in seconds (none if unset).
    pub request_timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            project: None,
            location: "global".to_string(),
            model: "gemini-2.5-flash".to_string(),
            base_url: None,
            access_token: None,
            credentials_path: None,
            metadata_host: DEFAULT_METADATA_HOST.to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: None,
        }
    }
}

impl UpstreamConfig {
    /// Fill unset fields from the standard Google Cloud environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.project.is_none() {
            self.project = var("GOOGLE_CLOUD_PROJECT");
        }
        if self.access_token.is_none() {
            self.access_token = var("GOOGLE_ACCESS_TOKEN");
        }
        if self.credentials_path.is_none() {
            self.credentials_path = var("GOOGLE_APPLICATION_CREDENTIALS")
                .map(PathBuf::from)
                .or_else(|| well_known_credentials_path(&var).filter(|p| p.is_file()));
        }
        if self.metadata_host == DEFAULT_METADATA_HOST {
            if let Some(host) = var("GCE_METADATA_HOST") {
                self.metadata_host = host;
            }
        }
    }

    /// Base URL for the configured location.
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.location == "global" => "https://aiplatform.googleapis.com".to_string(),
            None => format!("https://{}-aiplatform.googleapis.com", self.location),
        }
    }
}

/// Sampling parameters, system instruction and safety thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Sampling temperature.
    pub temperature: f64,

    /// Maximum number of output tokens.
    pub max_output_tokens: u32,

    /// System instruction text.
    pub system_instruction: String,

    /// Per-category safety thresholds.
    pub safety_settings: Vec<SafetySetting>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        let unfiltered = |category| SafetySetting {
            category,
            threshold: HarmBlockThreshold::Off,
        };
        Self {
            temperature: 0.7,
            max_output_tokens: 256,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            safety_settings: vec![
                unfiltered(HarmCategory::HateSpeech),
                unfiltered(HarmCategory::DangerousContent),
                unfiltered(HarmCategory::SexuallyExplicit),
                unfiltered(HarmCategory::Harassment),
            ],
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.server.listen, "0.0.0.0:5000");
        assert_eq!(cfg.upstream.location, "global");
        assert_eq!(cfg.upstream.model, "gemini-2.5-flash");
        assert_eq!(cfg.generation.temperature, 0.7);
        assert_eq!(cfg.generation.max_output_tokens, 256);
        assert_eq!(cfg.generation.safety_settings.len(), 4);
        assert!(cfg
            .generation
            .safety_settings
            .iter()
            .all(|s| s.threshold == HarmBlockThreshold::Off));
    }

    #[test]
    fn test_base_url_follows_location() {
        let mut upstream = UpstreamConfig::default();
        assert_eq!(upstream.resolved_base_url(), "https://aiplatform.googleapis.com");

        upstream.location = "us-central1".to_string();
        assert_eq!(
            upstream.resolved_base_url(),
            "https://us-central1-aiplatform.googleapis.com"
        );

        upstream.base_url = Some("http://127.0.0.1:9000/".to_string());
        assert_eq!(upstream.resolved_base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"upstream": {{"project": "demo-project"}}, "generation": {{"temperature": 0.2}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.upstream.project.as_deref(), Some("demo-project"));
        assert_eq!(cfg.upstream.location, "global");
        assert_eq!(cfg.generation.temperature, 0.2);
        assert_eq!(cfg.generation.max_output_tokens, 256);
        assert_eq!(cfg.server.listen, "0.0.0.0:5000");
    }

    #[test]
    fn test_env_fallbacks() {
        let gcloud = tempfile::tempdir().unwrap();
        let adc = gcloud.path().join("application_default_credentials.json");
        std::fs::write(&adc, r#"{"type": "authorized_user"}"#).unwrap();
        let dir = gcloud.path().to_string_lossy().into_owned();

        let mut upstream = UpstreamConfig::default();
        upstream.apply_env_from(|name| match name {
            "GOOGLE_CLOUD_PROJECT" => Some("env-project".to_string()),
            "CLOUDSDK_CONFIG" => Some(dir.clone()),
            "GCE_METADATA_HOST" => Some("127.0.0.1:8080".to_string()),
            _ => None,
        });
        assert_eq!(upstream.project.as_deref(), Some("env-project"));
        assert_eq!(upstream.access_token, None);
        assert_eq!(upstream.credentials_path.as_deref(), Some(adc.as_path()));
        assert_eq!(upstream.metadata_host, "127.0.0.1:8080");
    }

    #[test]
    fn test_explicit_credentials_env_wins() {
        let mut upstream = UpstreamConfig::default();
        upstream.apply_env_from(|name| match name {
            "GOOGLE_APPLICATION_CREDENTIALS" => Some("/etc/relay/key.json".to_string()),
            "HOME" => Some("/nonexistent".to_string()),
            _ => None,
        });
        assert_eq!(
            upstream.credentials_path.as_deref(),
            Some(std::path::Path::new("/etc/relay/key.json"))
        );
        assert_eq!(upstream.metadata_host, DEFAULT_METADATA_HOST);
    }

    #[test]
    fn test_no_adc_file_leaves_path_unset() {
        let mut upstream = UpstreamConfig::default();
        upstream.apply_env_from(|name| match name {
            "HOME" => Some("/nonexistent".to_string()),
            _ => None,
        });
        assert_eq!(upstream.credentials_path, None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/genai-relay.json")).unwrap();
        assert_eq!(cfg.generation.system_instruction, DEFAULT_SYSTEM_INSTRUCTION);
    }
}
