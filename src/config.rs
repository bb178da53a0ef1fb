//! Nmid-Registry Configuration
//!
//! Options and identity for a registry node. The final value is produced by
//! [`RegistryConfig::resolve`], which layers defaults, a TOML file, `NMIDR_*`
//! environment variables and command line overrides, then normalises and
//! validates the result. It is immutable after construction.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Prefix of environment variables consulted during resolution
pub const ENV_PREFIX: &str = "NMIDR_";

const MEMBERS_FILENAME: &str = "members.json";
const MEMBERS_BACKUP_FILENAME: &str = "members.bak.json";
const LEASE_LOG_FILENAME: &str = "lease.log";
const SERVER_LOG_FILENAME: &str = "etcd_server.log";

/// Role of this node in the store cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// Runs a store instance and takes part in its consensus group
    #[default]
    #[serde(alias = "master")]
    Host,
    /// Only connects to the store as a remote caller
    #[serde(alias = "slave")]
    Client,
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterRole::Host => write!(f, "host"),
            ClusterRole::Client => write!(f, "client"),
        }
    }
}

impl FromStr for ClusterRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "master" => Ok(ClusterRole::Host),
            "client" | "slave" => Ok(ClusterRole::Client),
            other => Err(Error::Config(format!(
                "invalid cluster role '{}', supported roles are host/client",
                other
            ))),
        }
    }
}

/// Initial state used when launching a store instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    #[default]
    New,
    Existing,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::New => write!(f, "new"),
            ClusterState::Existing => write!(f, "existing"),
        }
    }
}

/// Which store implementation backs the coordination layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Etcd,
    Memory,
}

impl FromStr for StoreBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "etcd" => Ok(StoreBackendKind::Etcd),
            "memory" => Ok(StoreBackendKind::Memory),
            other => Err(Error::Config(format!("invalid store backend '{}'", other))),
        }
    }
}

/// Main registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Node identity and directories
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster coordination configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Store backend configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable member name (derived from hostname and api address when empty)
    #[serde(default)]
    pub name: String,

    /// Home directory; relative directories below are resolved against it
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Store data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log directory (lease log and store server log)
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Membership file directory
    #[serde(default = "default_member_dir")]
    pub member_dir: PathBuf,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, validated against the name stored in the cluster
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Role of this node
    #[serde(default)]
    pub role: ClusterRole,

    /// Base timeout for store round-trips (e.g. "10s", "500ms")
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Heartbeat, membership sync and bootstrap retry interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A persisted lease with less remaining TTL than this is replaced
    #[serde(default = "default_min_lease_ttl_secs")]
    pub min_lease_ttl_secs: i64,

    /// Lower the log level to debug
    #[serde(default)]
    pub debug: bool,

    /// URLs to listen on for store client traffic
    #[serde(default = "default_client_urls")]
    pub listen_client_urls: Vec<String>,

    /// Client URLs advertised to the rest of the cluster
    #[serde(default = "default_client_urls")]
    pub advertise_client_urls: Vec<String>,

    /// URLs to listen on for store peer traffic
    #[serde(default = "default_peer_urls")]
    pub listen_peer_urls: Vec<String>,

    /// Peer URLs advertised to the rest of the cluster
    #[serde(default = "default_peer_urls")]
    pub initial_advertise_peer_urls: Vec<String>,

    /// Static (member name, peer URL) pairs forming the cluster
    #[serde(default)]
    pub initial_cluster: BTreeMap<String, String>,

    /// Peer URLs of an existing cluster to join
    #[serde(default)]
    pub join_urls: Vec<String>,

    /// Static store client endpoints
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Initial cluster state when a static initial cluster is used
    #[serde(default)]
    pub state: ClusterState,

    /// Maximum size in bytes for a single client request
    #[serde(default = "default_max_call_send_msg_size")]
    pub max_call_send_msg_size: usize,

    /// Discard existing membership and start a one-member cluster
    #[serde(default)]
    pub force_new_cluster: bool,
}

/// Store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend implementation
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Path of the etcd server binary launched by host nodes
    #[serde(default = "default_etcd_binary")]
    pub etcd_binary: PathBuf,

    /// Seconds to wait for a launched instance to become ready
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Reject read routes; fixed for the process lifetime
    #[serde(default)]
    pub write_only: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

/// Command line overrides, applied after the file and the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub name: Option<String>,
    pub cluster_name: Option<String>,
    pub role: Option<ClusterRole>,
    pub request_timeout: Option<String>,
    pub home_dir: Option<PathBuf>,
    pub api_address: Option<String>,
    pub backend: Option<StoreBackendKind>,
    pub endpoints: Vec<String>,
    pub join_urls: Vec<String>,
    pub debug: bool,
}

// Default value functions
fn default_home_dir() -> PathBuf {
    PathBuf::from("./")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_member_dir() -> PathBuf {
    PathBuf::from("member")
}

fn default_cluster_name() -> String {
    "nmid-cluster-default-name".to_string()
}

fn default_request_timeout() -> String {
    "10s".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_min_lease_ttl_secs() -> i64 {
    5
}

fn default_client_urls() -> Vec<String> {
    vec!["http://localhost:2379".to_string()]
}

fn default_peer_urls() -> Vec<String> {
    vec!["http://localhost:2380".to_string()]
}

fn default_max_call_send_msg_size() -> usize {
    10 * 1024 * 1024
}

fn default_etcd_binary() -> PathBuf {
    PathBuf::from("etcd")
}

fn default_startup_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "localhost:2381".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            home_dir: default_home_dir(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            member_dir: default_member_dir(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            role: ClusterRole::default(),
            request_timeout: default_request_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            min_lease_ttl_secs: default_min_lease_ttl_secs(),
            debug: false,
            listen_client_urls: default_client_urls(),
            advertise_client_urls: default_client_urls(),
            listen_peer_urls: default_peer_urls(),
            initial_advertise_peer_urls: default_peer_urls(),
            initial_cluster: BTreeMap::new(),
            join_urls: Vec::new(),
            endpoints: Vec::new(),
            state: ClusterState::default(),
            max_call_send_msg_size: default_max_call_send_msg_size(),
            force_new_cluster: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            etcd_binary: default_etcd_binary(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            write_only: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl RegistryConfig {
    /// Resolve the final configuration.
    ///
    /// Precedence, lowest first: defaults, the TOML file, `NMIDR_*`
    /// environment variables, command line overrides.
    pub fn resolve(
        file: Option<&Path>,
        env: &HashMap<String, String>,
        overrides: &ConfigOverrides,
    ) -> Result<Self> {
        let mut config = match file {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None => RegistryConfig::default(),
        };

        config.apply_env(env)?;
        config.apply_overrides(overrides);
        config.finish()
    }

    /// Load configuration from a TOML file without environment or overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::resolve(Some(path), &HashMap::new(), &ConfigOverrides::default())
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.normalize()?;
        self.adjust();
        self.validate()?;
        Ok(self)
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<()> {
        let var = |key: &str| {
            env.get(&format!("{}{}", ENV_PREFIX, key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let list = |value: String| -> Vec<String> {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        if let Some(v) = var("NAME") {
            self.node.name = v;
        }
        if let Some(v) = var("HOME_DIR") {
            self.node.home_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DATA_DIR") {
            self.node.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LOG_DIR") {
            self.node.log_dir = PathBuf::from(v);
        }
        if let Some(v) = var("CLUSTER_NAME") {
            self.cluster.name = v;
        }
        if let Some(v) = var("CLUSTER_ROLE") {
            self.cluster.role = v.parse()?;
        }
        if let Some(v) = var("CLUSTER_REQUEST_TIMEOUT") {
            self.cluster.request_timeout = v;
        }
        if let Some(v) = var("CLUSTER_ENDPOINTS") {
            self.cluster.endpoints = list(v);
        }
        if let Some(v) = var("CLUSTER_JOIN_URLS") {
            self.cluster.join_urls = list(v);
        }
        if let Some(v) = var("CLUSTER_DEBUG") {
            self.cluster.debug = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = var("API_ADDR") {
            self.api.bind_address = v;
        }
        if let Some(v) = var("STORE_BACKEND") {
            self.store.backend = v.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(name) = &overrides.name {
            self.node.name = name.clone();
        }
        if let Some(cluster_name) = &overrides.cluster_name {
            self.cluster.name = cluster_name.clone();
        }
        if let Some(role) = overrides.role {
            self.cluster.role = role;
        }
        if let Some(timeout) = &overrides.request_timeout {
            self.cluster.request_timeout = timeout.clone();
        }
        if let Some(home) = &overrides.home_dir {
            self.node.home_dir = home.clone();
        }
        if let Some(addr) = &overrides.api_address {
            self.api.bind_address = addr.clone();
        }
        if let Some(backend) = overrides.backend {
            self.store.backend = backend;
        }
        if !overrides.endpoints.is_empty() {
            self.cluster.endpoints = overrides.endpoints.clone();
        }
        if !overrides.join_urls.is_empty() {
            self.cluster.join_urls = overrides.join_urls.clone();
        }
        if overrides.debug {
            self.cluster.debug = true;
        }
    }

    /// Resolve directories against the home directory and derive the node name
    fn normalize(&mut self) -> Result<()> {
        if self.node.home_dir.as_os_str().is_empty() {
            return Err(Error::Config("empty node.home_dir".into()));
        }
        if self.node.home_dir.is_relative() {
            self.node.home_dir = std::env::current_dir()?.join(&self.node.home_dir);
        }

        let home = self.node.home_dir.clone();
        for dir in [
            &mut self.node.data_dir,
            &mut self.node.log_dir,
            &mut self.node.member_dir,
        ] {
            if dir.as_os_str().is_empty() {
                return Err(Error::Config("empty node directory".into()));
            }
            if dir.is_relative() {
                *dir = home.join(&*dir);
            }
        }

        if self.node.name.is_empty() {
            self.node.name = default_member_name(&self.api.bind_address);
        }

        Ok(())
    }

    /// A host asked to join through its own peer URL would join itself
    fn adjust(&mut self) {
        if self.cluster.role != ClusterRole::Host || self.uses_initial_cluster() {
            return;
        }
        let Some(join_url) = self.cluster.join_urls.first() else {
            return;
        };

        let joins_itself = self
            .cluster
            .initial_advertise_peer_urls
            .iter()
            .any(|peer_url| peer_url.eq_ignore_ascii_case(join_url));
        if joins_itself {
            tracing::warn!(
                "cluster.join_urls {:?} cleared because they point at this node",
                self.cluster.join_urls
            );
            self.cluster.join_urls.clear();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.is_empty() {
            return Err(Error::Config("cluster.name cannot be empty".into()));
        }
        validate_name(&self.cluster.name)?;
        validate_name(&self.node.name)?;

        parse_duration(&self.cluster.request_timeout).map_err(|e| {
            Error::Config(format!("invalid cluster.request_timeout: {}", e))
        })?;

        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "cluster.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.cluster.min_lease_ttl_secs < 0 {
            return Err(Error::Config(
                "cluster.min_lease_ttl_secs cannot be negative".into(),
            ));
        }

        parse_urls("cluster.join_urls", &self.cluster.join_urls)?;
        parse_urls("cluster.endpoints", &self.cluster.endpoints)?;

        match self.cluster.role {
            ClusterRole::Client => {
                if self.cluster.force_new_cluster {
                    return Err(Error::Config("client role got cluster.force_new_cluster".into()));
                }
                if self.cluster.endpoints.is_empty() && self.cluster.join_urls.is_empty() {
                    return Err(Error::Config(
                        "client role needs cluster.endpoints or cluster.join_urls".into(),
                    ));
                }
            }
            ClusterRole::Host => {
                let required = [
                    ("cluster.listen_client_urls", &self.cluster.listen_client_urls),
                    ("cluster.listen_peer_urls", &self.cluster.listen_peer_urls),
                    ("cluster.advertise_client_urls", &self.cluster.advertise_client_urls),
                    (
                        "cluster.initial_advertise_peer_urls",
                        &self.cluster.initial_advertise_peer_urls,
                    ),
                ];
                for (field, urls) in required {
                    if urls.is_empty() {
                        return Err(Error::Config(format!("empty {}", field)));
                    }
                    parse_urls(field, urls)?;
                }

                for (name, peer_url) in &self.cluster.initial_cluster {
                    validate_name(name)?;
                    parse_urls("cluster.initial_cluster", std::slice::from_ref(peer_url))?;
                }
            }
        }

        split_host_port(&self.api.bind_address)
            .map_err(|e| Error::Config(format!("invalid api.bind_address: {}", e)))?;

        if self.store.startup_timeout_secs == 0 {
            return Err(Error::Config(
                "store.startup_timeout_secs must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Member name of this node
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn is_host(&self) -> bool {
        self.cluster.role == ClusterRole::Host
    }

    /// Get the base request timeout as Duration
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.cluster.request_timeout)
            .map_err(|e| Error::Config(format!("invalid cluster request timeout: {}", e)))
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get store startup timeout as Duration
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.store.startup_timeout_secs)
    }

    /// Whether a static initial cluster map is configured
    pub fn uses_initial_cluster(&self) -> bool {
        !self.cluster.initial_cluster.is_empty()
    }

    /// Static initial cluster as "name=peerUrl,..." sorted by name
    pub fn initial_cluster_string(&self) -> String {
        self.cluster
            .initial_cluster
            .iter()
            .map(|(name, peer_url)| format!("{}={}", name, peer_url))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Statically configured store endpoints
    pub fn static_endpoints(&self) -> Vec<String> {
        match self.cluster.role {
            ClusterRole::Host => self.cluster.advertise_client_urls.clone(),
            ClusterRole::Client if !self.cluster.endpoints.is_empty() => {
                self.cluster.endpoints.clone()
            }
            ClusterRole::Client => self.cluster.join_urls.clone(),
        }
    }

    /// First advertised client URL, the endpoint this node defragments
    pub fn first_advertise_client_url(&self) -> Result<&str> {
        self.cluster
            .advertise_client_urls
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::Config("cluster.advertise_client_urls is empty".into()))
    }

    /// First advertised peer URL
    pub fn first_advertise_peer_url(&self) -> Option<&str> {
        self.cluster
            .initial_advertise_peer_urls
            .first()
            .map(String::as_str)
    }

    pub fn members_file(&self) -> PathBuf {
        self.node.member_dir.join(MEMBERS_FILENAME)
    }

    pub fn members_backup_file(&self) -> PathBuf {
        self.node.member_dir.join(MEMBERS_BACKUP_FILENAME)
    }

    pub fn lease_log_file(&self) -> PathBuf {
        self.node.log_dir.join(LEASE_LOG_FILENAME)
    }

    pub fn server_log_file(&self) -> PathBuf {
        self.node.log_dir.join(SERVER_LOG_FILENAME)
    }

    /// Create every directory the node writes to
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.node.home_dir,
            &self.node.data_dir,
            &self.node.log_dir,
            &self.node.member_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Parse a duration such as "10s", "500ms", "1.5m" or "2h"
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| format!("missing unit in duration '{}'", value))?;
    let (number, unit) = value.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid number in duration '{}'", value))?;
    let secs = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, value)),
    };

    if secs <= 0.0 || !secs.is_finite() {
        return Err(format!("duration '{}' must be positive", value));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Names are used in store keys and URLs
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid name '{}'", name)))
    }
}

fn parse_urls(field: &str, urls: &[String]) -> Result<Vec<Url>> {
    urls.iter()
        .map(|raw| {
            let url = Url::parse(raw)
                .map_err(|e| Error::Config(format!("invalid {} '{}': {}", field, raw, e)))?;
            if url.host_str().is_none() {
                return Err(Error::Config(format!(
                    "invalid {} '{}': missing host",
                    field, raw
                )));
            }
            Ok(url)
        })
        .collect()
}

fn split_host_port(addr: &str) -> std::result::Result<(&str, u16), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in address '{}'", addr))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in address '{}'", addr))?;
    Ok((host, port))
}

fn default_member_name(api_addr: &str) -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());

    format!("{}-{}", hostname, api_addr)
        .chars()
        .map(|c| if matches!(c, ',' | ':' | '=') { '-' } else { c })
        .collect()
}
