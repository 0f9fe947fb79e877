// Configuration loading tests

use shashin::config::*;

const FULL: &str = r#"
origin:
  address: "127.0.0.1"
  port: 9090
  request_timeout_ms: 5000
edge:
  port: 9443
  origin: "origin.internal:9090"
  origin_tls: true
  origin_sni: "origin.internal"
  environment: development
images:
  source_buckets: ["photos", "overlays"]
  cors_enabled: true
  cors_origin: "https://example.com"
  auto_webp: true
  enable_signature: true
  fallback:
    enabled: true
    bucket: "photos"
    key: "fallback.png"
  limits:
    max_width: 4096
    max_height: 4096
  overlay_cache:
    max_entries: 10
    ttl_seconds: 60
s3:
  region: "eu-west-1"
  endpoint: "http://localhost:9000"
secret:
  source: http
  id: "hmac"
  endpoint: "http://secrets.internal/v1"
  json_field: "key"
tenants:
  enabled: true
  endpoint: "http://tenants.internal"
detection:
  endpoint: "http://vision.internal"
logging:
  format: text
  level: debug
"#;

#[test]
fn test_full_config_deserializes() {
    let config = Config::from_yaml_with_env(FULL).expect("Failed to parse config");
    assert_eq!(config.origin.port, 9090);
    assert_eq!(config.origin.request_timeout_ms, 5000);
    assert_eq!(config.edge.environment, Environment::Development);
    assert!(config.edge.origin_tls);
    assert_eq!(config.images.source_buckets, vec!["photos", "overlays"]);
    assert_eq!(config.default_bucket(), Some("photos"));
    assert!(config.images.fallback.enabled);
    assert_eq!(config.images.limits.max_width, 4096);
    assert_eq!(config.images.overlay_cache.ttl_seconds, 60);
    assert_eq!(config.s3.region, "eu-west-1");
    assert_eq!(config.secret.source, SecretSource::Http);
    assert_eq!(config.secret.json_field.as_deref(), Some("key"));
    assert!(config.tenants.enabled);
    assert_eq!(config.detection.as_ref().map(|d| d.timeout_ms), Some(5000));
    assert_eq!(config.logging.format, LogFormat::Text);
    assert!(config.validate().is_ok());
}

#[test]
fn test_defaults_apply_to_sparse_config() {
    let config = Config::from_yaml_with_env(
        r#"
images:
  source_buckets: ["photos"]
secret:
  value: "abc"
"#,
    )
    .unwrap();
    assert_eq!(config.origin.address, "0.0.0.0");
    assert_eq!(config.origin.port, 8080);
    assert_eq!(config.origin.request_timeout_ms, 29_000);
    assert_eq!(config.edge.port, 8443);
    assert_eq!(config.edge.environment, Environment::Production);
    assert_eq!(config.images.cors_origin, "*");
    assert_eq!(config.secret.id, "hmacSecret");
    assert_eq!(config.logging.level, "info");
    assert!(config.detection.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_tenants_enabled_without_endpoint_is_invalid() {
    let config = Config::from_yaml_with_env(
        r#"
images:
  source_buckets: ["photos"]
secret:
  value: "abc"
tenants:
  enabled: true
"#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("tenants.endpoint"));
}

#[test]
fn test_secret_value_is_not_serialized() {
    let config = Config::from_yaml_with_env(
        r#"
images:
  source_buckets: ["photos"]
secret:
  value: "do-not-print"
"#,
    )
    .unwrap();
    let rendered = serde_yaml::to_string(&config).unwrap();
    assert!(!rendered.contains("do-not-print"));
}
