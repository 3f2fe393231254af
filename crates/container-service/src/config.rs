//! Configuration parsing and validation.
//!
//! `fleetd` is configured via a TOML file (default: `./config/fleet.toml`)
//! layered with environment variable overrides for the deployment-style
//! secrets a TOML file should not carry: store DSNs/endpoints, provider
//! keys, and the MCP bearer token. Mirrors the teacher's `config::Config` /
//! `load_config` shape (one struct per concern, `#[serde(default = "fn")]`
//! throughout, `anyhow::bail!` validation at the end of loading) extended
//! with an env-var overlay pass.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub relational: RelationalConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub object: ObjectConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub nl2cypher: Nl2CypherConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub job_queue: JobQueueConfig,
    #[serde(default)]
    pub retrieval: RetrievalDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelationalConfig {
    /// Postgres connection string. Overridable by `FLEET_RELATIONAL_DSN`.
    pub dsn: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default)]
    pub auto_migrate: bool,
}

fn default_pool_size() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_vector_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_vector_url() -> String {
    "http://localhost:6333".to_string()
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: default_vector_url(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectConfig {
    #[serde(default = "default_object_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_object_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default = "default_object_region")]
    pub region: String,
}

fn default_object_endpoint() -> String {
    "http://localhost:9000".to_string()
}
fn default_object_bucket() -> String {
    "container-fleet".to_string()
}
fn default_object_region() -> String {
    "us-east-1".to_string()
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            endpoint: default_object_endpoint(),
            bucket: default_object_bucket(),
            access_key_id: None,
            secret_access_key: None,
            region: default_object_region(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_graph_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_hops")]
    pub default_max_hops: u32,
}

fn default_graph_url() -> String {
    "http://localhost:7474".to_string()
}
fn default_max_hops() -> u32 {
    2
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: default_graph_url(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
            default_max_hops: default_max_hops(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    32
}
fn default_cache_ttl_secs() -> i64 {
    30 * 24 * 3600
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            api_key: None,
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            timeout_ms: default_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rerank_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
}

fn default_rerank_cache_ttl_secs() -> i64 {
    300
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
            cache_ttl_secs: default_rerank_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Nl2CypherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Nl2CypherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            api_key: None,
            model: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Required to start (§6 Exit conditions), read from `FLEET_BEARER_TOKEN`
    /// or `bearer_token_file`. Not deserialized from TOML directly so it
    /// never lands in a checked-in config file.
    #[serde(skip)]
    pub bearer_token: String,
    #[serde(default)]
    pub bearer_token_file: Option<PathBuf>,
    #[serde(default)]
    pub document_fetch_enabled: bool,
    #[serde(default)]
    pub admin_fastpath: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobQueueConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_heartbeat_secs() -> u64 {
    30
}
fn default_visibility_timeout_secs() -> i64 {
    300
}
fn default_max_retries() -> i32 {
    5
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_worker_count() -> usize {
    4
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_count: default_worker_count(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalDefaults {
    #[serde(default = "default_global_latency_budget_ms")]
    pub global_latency_budget_ms: i64,
    #[serde(default = "default_k")]
    pub default_k: i64,
    #[serde(default = "default_max_k")]
    pub max_k: i64,
}

fn default_global_latency_budget_ms() -> i64 {
    2000
}
fn default_k() -> i64 {
    10
}
fn default_max_k() -> i64 {
    50
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            global_latency_budget_ms: default_global_latency_budget_ms(),
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

/// Load config from a TOML file, then apply environment variable overrides,
/// then validate. Mirrors `config::load_config`'s structure in the teacher.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&content).with_context(|| "failed to parse config file")?;

    apply_env_overrides(&mut config)?;
    resolve_bearer_token(&mut config.server)?;
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(dsn) = std::env::var("FLEET_RELATIONAL_DSN") {
        config.relational.dsn = dsn;
    }
    if let Ok(url) = std::env::var("FLEET_VECTOR_URL") {
        config.vector.url = url;
    }
    if let Ok(key) = std::env::var("FLEET_VECTOR_API_KEY") {
        config.vector.api_key = Some(key);
    }
    if let Ok(endpoint) = std::env::var("FLEET_OBJECT_ENDPOINT") {
        config.object.endpoint = endpoint;
    }
    if let Ok(bucket) = std::env::var("FLEET_OBJECT_BUCKET") {
        config.object.bucket = bucket;
    }
    if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
        config.object.access_key_id = Some(key);
    }
    if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
        config.object.secret_access_key = Some(secret);
    }
    if let Ok(url) = std::env::var("FLEET_GRAPH_URL") {
        config.graph.url = url;
    }
    if let Ok(key) = std::env::var("FLEET_GRAPH_API_KEY") {
        config.graph.api_key = Some(key);
    }
    if let Ok(provider) = std::env::var("FLEET_EMBEDDING_PROVIDER") {
        config.embedding.provider = provider;
    }
    if let Ok(url) = std::env::var("FLEET_EMBEDDING_URL") {
        config.embedding.url = Some(url);
    }
    if let Ok(key) = std::env::var("FLEET_EMBEDDING_API_KEY") {
        config.embedding.api_key = Some(key);
    }
    if let Ok(url) = std::env::var("FLEET_RERANK_URL") {
        config.rerank.url = Some(url);
        config.rerank.enabled = true;
    }
    if let Ok(url) = std::env::var("FLEET_NL2CYPHER_URL") {
        config.nl2cypher.url = Some(url);
        config.nl2cypher.enabled = true;
    }
    if let Ok(val) = std::env::var("FLEET_AUTO_MIGRATE") {
        config.relational.auto_migrate = parse_bool_env(&val);
    }
    if let Ok(val) = std::env::var("FLEET_ADMIN_FASTPATH") {
        config.server.admin_fastpath = parse_bool_env(&val);
    }
    if let Ok(val) = std::env::var("FLEET_DOCUMENT_FETCH") {
        config.server.document_fetch_enabled = parse_bool_env(&val);
    }
    Ok(())
}

fn parse_bool_env(val: &str) -> bool {
    matches!(val, "1" | "true" | "TRUE" | "yes")
}

/// Startup fails if the bearer token is neither set nor readable from its
/// file path (§6 Exit conditions).
fn resolve_bearer_token(server: &mut ServerConfig) -> Result<()> {
    if let Ok(token) = std::env::var("FLEET_BEARER_TOKEN") {
        server.bearer_token = token;
        return Ok(());
    }
    if let Some(path) = &server.bearer_token_file {
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bearer token file: {}", path.display()))?;
        server.bearer_token = token.trim().to_string();
        return Ok(());
    }
    bail!("bearer token not configured: set FLEET_BEARER_TOKEN or server.bearer_token_file")
}

fn validate(config: &Config) -> Result<()> {
    if config.relational.dsn.trim().is_empty() {
        bail!("relational.dsn must not be empty");
    }
    if config.server.bearer_token.trim().is_empty() {
        bail!("resolved bearer token is empty");
    }
    if config.retrieval.max_k < 1 {
        bail!("retrieval.max_k must be >= 1");
    }
    if config.retrieval.default_k < 1 || config.retrieval.default_k > config.retrieval.max_k {
        bail!("retrieval.default_k must be in [1, max_k]");
    }
    if config.retrieval.global_latency_budget_ms <= 0 {
        bail!("retrieval.global_latency_budget_ms must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "unknown embedding provider: '{}'. must be disabled, openai, ollama, or local",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0 when a provider is enabled");
    }
    if config.job_queue.max_retries < 1 {
        bail!("job_queue.max_retries must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
        [relational]
        dsn = "postgres://localhost/fleet"

        [server]
        bind = "0.0.0.0:8080"
        "#
        .to_string()
    }

    #[test]
    fn missing_bearer_token_fails_to_load() {
        std::env::remove_var("FLEET_BEARER_TOKEN");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn env_token_and_dsn_override_load_successfully() {
        std::env::set_var("FLEET_BEARER_TOKEN", "test-token");
        std::env::set_var("FLEET_RELATIONAL_DSN", "postgres://localhost/override");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.relational.dsn, "postgres://localhost/override");
        assert_eq!(cfg.server.bearer_token, "test-token");
        std::env::remove_var("FLEET_BEARER_TOKEN");
        std::env::remove_var("FLEET_RELATIONAL_DSN");
    }

    #[test]
    fn rejects_unknown_embedding_provider() {
        std::env::set_var("FLEET_BEARER_TOKEN", "test-token");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        let mut toml = minimal_toml();
        toml.push_str("\n[embedding]\nprovider = \"bogus\"\n");
        std::fs::write(&path, toml).unwrap();
        assert!(load_config(&path).is_err());
        std::env::remove_var("FLEET_BEARER_TOKEN");
    }
}
