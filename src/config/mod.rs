// Configuration module

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub origin: ServerConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub secret: SecretConfig,
    #[serde(default)]
    pub tenants: TenantConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        // Replace ${VAR_NAME} with environment variable values
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;

        for caps in re.captures_iter(yaml) {
            let var_name = &caps[1];
            std::env::var(var_name).map_err(|_| {
                format!(
                    "Environment variable '{}' is referenced but not set",
                    var_name
                )
            })?;
        }

        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        });

        serde_yaml::from_str(&substituted).map_err(|e| e.to_string())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.origin.port == 0 {
            return Err("origin.port must be greater than 0".to_string());
        }
        if self.origin.request_timeout_ms == 0 {
            return Err("origin.request_timeout_ms must be greater than 0".to_string());
        }

        if self.images.source_buckets.is_empty() {
            return Err("images.source_buckets must list at least one bucket".to_string());
        }
        let mut seen = HashSet::new();
        for bucket in &self.images.source_buckets {
            if bucket.trim().is_empty() {
                return Err("images.source_buckets contains an empty bucket name".to_string());
            }
            if !seen.insert(bucket) {
                return Err(format!(
                    "Duplicate bucket '{}' in images.source_buckets",
                    bucket
                ));
            }
        }

        let fallback = &self.images.fallback;
        if fallback.enabled && (fallback.bucket.is_empty() || fallback.key.is_empty()) {
            return Err(
                "images.fallback is enabled but bucket or key is empty".to_string(),
            );
        }

        if self.tenants.enabled && self.tenants.endpoint.is_empty() {
            return Err("tenants.enabled requires tenants.endpoint".to_string());
        }

        match self.secret.source {
            SecretSource::Static => {
                if self.secret.value.as_deref().unwrap_or_default().is_empty() {
                    return Err("secret.source 'static' requires secret.value".to_string());
                }
            }
            SecretSource::Http => {
                if self.secret.endpoint.as_deref().unwrap_or_default().is_empty() {
                    return Err("secret.source 'http' requires secret.endpoint".to_string());
                }
            }
        }

        if let Some(detection) = &self.detection {
            if detection.endpoint.is_empty() {
                return Err("detection.endpoint cannot be empty".to_string());
            }
            if detection.timeout_ms == 0 {
                return Err("detection.timeout_ms must be greater than 0".to_string());
            }
        }

        if self.edge.origin.is_empty() {
            return Err("edge.origin cannot be empty".to_string());
        }

        Ok(())
    }

    /// Bucket used when a request does not name one.
    pub fn default_bucket(&self) -> Option<&str> {
        self.images.source_buckets.first().map(String::as_str)
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_origin_port() -> u16 {
    8080
}

fn default_edge_port() -> u16 {
    8443
}

fn default_request_timeout_ms() -> u64 {
    29_000
}

fn default_edge_origin() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_origin_port")]
    pub port: u16,
    /// Deadline for a whole handler invocation.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_origin_port(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Deployment environment of the edge; controls error detail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_edge_port")]
    pub port: u16,
    /// Upstream origin as `host:port`.
    #[serde(default = "default_edge_origin")]
    pub origin: String,
    #[serde(default)]
    pub origin_tls: bool,
    #[serde(default)]
    pub origin_sni: String,
    #[serde(default)]
    pub environment: Environment,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_edge_port(),
            origin: default_edge_origin(),
            origin_tls: false,
            origin_sni: String::new(),
            environment: Environment::default(),
        }
    }
}

fn default_cors_origin() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Buckets requests may read from. The first entry is the default.
    #[serde(default)]
    pub source_buckets: Vec<String>,
    #[serde(default)]
    pub cors_enabled: bool,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default)]
    pub auto_webp: bool,
    /// Require a `signature` query parameter on origin requests.
    #[serde(default)]
    pub enable_signature: bool,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub limits: ImageLimitsConfig,
    #[serde(default)]
    pub overlay_cache: OverlayCacheConfig,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            source_buckets: Vec::new(),
            cors_enabled: false,
            cors_origin: default_cors_origin(),
            auto_webp: false,
            enable_signature: false,
            fallback: FallbackConfig::default(),
            limits: ImageLimitsConfig::default(),
            overlay_cache: OverlayCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
}

fn default_max_dimension() -> u32 {
    16384
}

fn default_max_pixels() -> u64 {
    100_000_000
}

fn default_max_input_size() -> usize {
    50 * 1024 * 1024 // 50 MB
}

/// Decode safety limits (image bomb protection)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLimitsConfig {
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
}

impl Default for ImageLimitsConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            max_pixels: default_max_pixels(),
            max_input_size: default_max_input_size(),
        }
    }
}

fn default_overlay_cache_entries() -> u64 {
    100
}

fn default_overlay_cache_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayCacheConfig {
    #[serde(default = "default_overlay_cache_entries")]
    pub max_entries: u64,
    #[serde(default = "default_overlay_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for OverlayCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_overlay_cache_entries(),
            ttl_seconds: default_overlay_cache_ttl_seconds(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Static credentials; the default AWS provider chain is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: None,
            access_key: None,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    #[default]
    Static,
    Http,
}

fn default_secret_id() -> String {
    "hmacSecret".to_string()
}

fn default_remote_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretConfig {
    #[serde(default)]
    pub source: SecretSource,
    /// Secret identifier at the store.
    #[serde(default = "default_secret_id")]
    pub id: String,
    /// Literal secret for the static source.
    #[serde(skip_serializing)]
    pub value: Option<String>,
    /// Base URL of the secret store for the http source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Field to extract when the stored secret is a JSON document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_field: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            source: SecretSource::default(),
            id: default_secret_id(),
            value: None,
            endpoint: None,
            json_field: None,
            timeout_ms: default_remote_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Gate every request on the tenant's activation status.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            timeout_ms: default_remote_timeout_ms(),
        }
    }
}

fn default_detection_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub endpoint: String,
    #[serde(default = "default_detection_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}
