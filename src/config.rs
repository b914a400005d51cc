//! Configuration management for commit_searcher
//!
//! Supports loading configuration from TOML files with CLI overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every environment variable the server reads.
const ENV_PREFIX: &str = "COMMIT_SEARCHER_";

/// Span export. Console logging is always on; spans go to an OTLP collector
/// only when an endpoint is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// OTLP gRPC endpoint, empty to keep export off
    #[serde(default)]
    pub otlp_endpoint: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "searcher".to_string()
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            service_name: default_service_name(),
        }
    }
}

impl TracingConfig {
    pub fn export_enabled(&self) -> bool {
        !self.otlp_endpoint.is_empty()
    }

    /// Apply `COMMIT_SEARCHER_OTLP_ENDPOINT` and
    /// `COMMIT_SEARCHER_SERVICE_NAME` over the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_vars(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        // an empty endpoint turns export off
        if let Some(endpoint) = var("OTLP_ENDPOINT") {
            self.otlp_endpoint = endpoint;
        }
        if let Some(name) = var("SERVICE_NAME").filter(|n| !n.is_empty()) {
            self.service_name = name;
        }
        self
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub hybrid: HybridConfig,

    #[serde(default)]
    pub structural: StructuralConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_address() -> String {
    "0.0.0.0:3181".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

/// Archive store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding cached zip archives
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Evict least recently used archives above this size
    #[serde(default = "default_max_cache_size_mb")]
    pub max_cache_size_mb: u64,

    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Files larger than this keep their path but not their content,
    /// unless matched by `large_file_patterns`
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Globs allow-listing large files. The last matching pattern wins; a
    /// leading `!` excludes.
    #[serde(default)]
    pub large_file_patterns: Vec<String>,

    /// How long a request waits for an archive before giving up with a
    /// temporary error. Requests may override it.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Upper bound for one archive fetch, which outlives the request
    #[serde(default = "default_background_timeout_secs")]
    pub background_timeout_secs: u64,

    /// Concurrent fetches allowed per replica of the tar source
    #[serde(default = "default_fetch_limit_per_replica")]
    pub fetch_limit_per_replica: usize,

    #[serde(default = "default_limiter_refresh_secs")]
    pub limiter_refresh_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("commit_searcher")
}

fn default_max_cache_size_mb() -> u64 {
    10 * 1024
}

fn default_eviction_interval_secs() -> u64 {
    60
}

fn default_max_file_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_fetch_timeout_ms() -> u64 {
    500
}

fn default_background_timeout_secs() -> u64 {
    600
}

fn default_fetch_limit_per_replica() -> usize {
    15
}

fn default_limiter_refresh_secs() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_size_mb: default_max_cache_size_mb(),
            eviction_interval_secs: default_eviction_interval_secs(),
            max_file_size: default_max_file_size(),
            large_file_patterns: Vec::new(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            background_timeout_secs: default_background_timeout_secs(),
            fetch_limit_per_replica: default_fetch_limit_per_replica(),
            limiter_refresh_secs: default_limiter_refresh_secs(),
        }
    }
}

impl StoreConfig {
    /// Fingerprint of everything that changes archive contents.
    /// Part of every cache key so a config change never serves stale archives.
    pub fn fingerprint(&self) -> String {
        // pattern order matters (last match wins), so no sorting here
        let config_str = format!(
            "max_size:{}|large_files:{:?}",
            self.max_file_size, self.large_file_patterns
        );
        format!("{:x}", md5::compute(config_str.as_bytes()))
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mb * 1024 * 1024
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }
}

/// Matching engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Worker threads per search (0 = number of CPUs)
    #[serde(default)]
    pub workers: usize,

    /// Limit used when a request does not set one
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Deadline for a whole search when the request does not set one
    /// (0 = no deadline)
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_limit() -> usize {
    500
}

fn default_search_timeout_ms() -> u64 {
    60_000
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            default_limit: default_limit(),
            timeout_ms: default_search_timeout_ms(),
        }
    }
}

impl SearchConfig {
    /// Deadline for a request asking for `requested_ms` (0 = server default).
    pub fn timeout(&self, requested_ms: u64) -> Option<Duration> {
        match (requested_ms, self.timeout_ms) {
            (0, 0) => None,
            (0, ms) | (ms, _) => Some(Duration::from_millis(ms)),
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }
}

/// Hybrid (index + live) search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Abandon hybrid search when the changed paths add up to more bytes
    /// than this
    #[serde(default = "default_max_total_paths_length")]
    pub max_total_paths_length: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_total_paths_length() -> usize {
    100_000
}

fn default_max_attempts() -> usize {
    5
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_total_paths_length: default_max_total_paths_length(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Structural search subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralConfig {
    /// Path to the `comby` binary
    #[serde(default = "default_comby_path")]
    pub comby_path: PathBuf,

    /// Value passed to `-jobs`
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_comby_path() -> PathBuf {
    PathBuf::from("comby")
}

fn default_jobs() -> usize {
    4
}

impl Default for StructuralConfig {
    fn default() -> Self {
        Self {
            comby_path: default_comby_path(),
            jobs: default_jobs(),
        }
    }
}

/// Where archives, ignore files and diffs come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory of bare git repositories, laid out as `<repo name>.git` or
    /// `<repo name>`
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,

    /// Path to the `git` binary
    #[serde(default = "default_git_path")]
    pub git_path: PathBuf,
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("repos")
}

fn default_git_path() -> PathBuf {
    PathBuf::from("git")
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
            git_path: default_git_path(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from default locations
    ///
    /// Search order:
    /// 1. COMMIT_SEARCHER_CONFIG environment variable
    /// 2. ./commit_searcher.toml (current directory)
    /// 3. ~/.config/commit_searcher/config.toml (user config)
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        if let Ok(env_path) = std::env::var(format!("{ENV_PREFIX}CONFIG")) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }

        let local_path = PathBuf::from("commit_searcher.toml");
        if local_path.exists() {
            let config = Self::from_file(&local_path)?;
            return Ok(Some((config, local_path)));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("commit_searcher").join("config.toml");
            if user_path.exists() {
                let config = Self::from_file(&user_path)?;
                return Ok(Some((config, user_path)));
            }
        }

        Ok(None)
    }

    /// Generate a template configuration file
    pub fn generate_template() -> String {
        r#"# Commit Searcher Configuration
# Generated template - customize as needed

[server]
# Address to bind the HTTP server to
address = "0.0.0.0:3181"

[store]
# Directory for cached zip archives (default: <user cache dir>/commit_searcher)
# cache_dir = "/var/cache/commit_searcher"

# Evict least recently used archives once the cache exceeds this size
max_cache_size_mb = 10240
eviction_interval_secs = 60

# Files above this size (bytes) are searchable by path only
max_file_size = 1048576

# Globs allow-listing large files for content search.
# The last matching pattern wins; prefix with ! to exclude.
# large_file_patterns = ["**/*.sql", "!**/dump.sql"]

# Time a request waits for an archive before returning a temporary error
fetch_timeout_ms = 500

# Upper bound for a single archive fetch (runs independently of requests)
background_timeout_secs = 600

# Concurrent fetches per tar source replica
fetch_limit_per_replica = 15
limiter_refresh_secs = 30

[search]
# Worker threads per search (0 = number of CPUs)
workers = 0
default_limit = 500
# Deadline for a whole search in milliseconds (0 = none); requests may set
# their own with "timeout_ms"
timeout_ms = 60000

[hybrid]
# Search unchanged files through the external index when possible
enabled = true
max_total_paths_length = 100000
max_attempts = 5

[structural]
comby_path = "comby"
jobs = 4

[source]
# Directory containing bare git repositories
repos_dir = "repos"
git_path = "git"

[tracing]
# OTLP gRPC endpoint for span export, e.g. "http://localhost:4317".
# Empty keeps export off; console logging is always active.
# Env override: COMMIT_SEARCHER_OTLP_ENDPOINT
otlp_endpoint = ""

# Env override: COMMIT_SEARCHER_SERVICE_NAME
service_name = "searcher"
"#
        .to_string()
    }

    /// Write template config to the specified path
    pub fn write_template(path: &Path) -> Result<()> {
        let template = Self::generate_template();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, template)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Merge CLI overrides into the configuration
    pub fn with_overrides(
        mut self,
        address: Option<String>,
        cache_dir: Option<PathBuf>,
        repos_dir: Option<PathBuf>,
    ) -> Self {
        if let Some(addr) = address {
            self.server.address = addr;
        }
        if let Some(dir) = cache_dir {
            self.store.cache_dir = dir;
        }
        if let Some(dir) = repos_dir {
            self.source.repos_dir = dir;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.address, "0.0.0.0:3181");
        assert_eq!(config.store.fetch_timeout_ms, 500);
        assert_eq!(config.hybrid.max_attempts, 5);
        assert!(config.search.worker_count() >= 1);
    }

    #[test]
    fn test_tracing_env_overrides() {
        let tracing = TracingConfig::default();
        assert!(!tracing.export_enabled());
        assert_eq!(tracing.service_name, "searcher");

        let vars = |name: &str| match name {
            "OTLP_ENDPOINT" => Some("http://collector:4317".to_string()),
            "SERVICE_NAME" => Some(String::new()),
            _ => None,
        };
        let tracing = tracing.with_vars(vars);
        assert!(tracing.export_enabled());
        assert_eq!(tracing.otlp_endpoint, "http://collector:4317");
        assert_eq!(tracing.service_name, "searcher");

        let tracing = tracing.with_vars(|name| (name == "OTLP_ENDPOINT").then(String::new));
        assert!(!tracing.export_enabled());
    }

    #[test]
    fn test_search_timeout() {
        let mut search = SearchConfig::default();
        assert_eq!(search.timeout(0), Some(Duration::from_secs(60)));
        assert_eq!(search.timeout(250), Some(Duration::from_millis(250)));
        search.timeout_ms = 0;
        assert_eq!(search.timeout(0), None);
        assert_eq!(search.timeout(10), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
address = "127.0.0.1:8080"

[store]
cache_dir = "/tmp/csr"
large_file_patterns = ["*.sql"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.address, "127.0.0.1:8080");
        assert_eq!(config.store.cache_dir, PathBuf::from("/tmp/csr"));
        assert_eq!(config.store.max_file_size, 1024 * 1024);
        assert!(config.hybrid.enabled);
    }

    #[test]
    fn test_generate_template_parses() {
        let template = Config::generate_template();
        assert!(template.contains("[store]"));
        let config: Config = toml::from_str(&template).unwrap();
        assert_eq!(config.structural.jobs, 4);
        assert!(!config.tracing.export_enabled());
    }

    #[test]
    fn test_fingerprint_tracks_filter_config() {
        let a = StoreConfig::default();
        let mut b = StoreConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.large_file_patterns = vec!["*.sql".into()];
        assert_ne!(a.fingerprint(), b.fingerprint());

        // cache location does not change archive contents
        let mut c = StoreConfig::default();
        c.cache_dir = PathBuf::from("/elsewhere");
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_overrides() {
        let config = Config::default().with_overrides(
            Some("127.0.0.1:1".into()),
            Some(PathBuf::from("/c")),
            None,
        );
        assert_eq!(config.server.address, "127.0.0.1:1");
        assert_eq!(config.store.cache_dir, PathBuf::from("/c"));
        assert_eq!(config.source.repos_dir, PathBuf::from("repos"));
    }
}
