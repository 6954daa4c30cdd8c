// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for agora nodes (hosts, authorities and
// the broker ACL hook):
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Authority endpoints and internal overrides
// - Host identity and client secret (supports env:VAR indirection)
// - Clock, broker, retry and credential relay tuning
// - ACL hook listener and token verification settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub authority: AuthorityConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostConfig>,

    #[serde(default)]
    pub clock: ClockConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub credentials: CredentialConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl_hook: Option<AclHookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Public base URI; its hostname is the authority id.
    pub uri: String,

    /// Base URI used for discovery from inside the deployment; also rewrites
    /// the host/port of the discovered token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_uri: Option<String>,

    /// Fixed broker endpoint; never overwritten by discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_uri: Option<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            uri: default_authority_uri(),
            internal_uri: None,
            broker_uri: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: String,

    /// Client secret. `env:VAR` reads the value from the environment.
    pub secret: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HostConfig {
    pub fn resolve_secret(&self) -> anyhow::Result<String> {
        resolve_env_reference(&self.secret)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Single time source replacing the pool. Must end with "pool.ntp.org".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ntp_host: Option<String>,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    #[serde(default = "default_clock_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            custom_ntp_host: None,
            resync_interval_secs: default_resync_interval(),
            max_backoff_secs: default_clock_max_backoff(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl ClockConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fixed delay between full connect attempts.
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_secs: u64,

    /// Cap of the discovery backoff (starts at 1s, doubles).
    #[serde(default = "default_discovery_max_backoff")]
    pub discovery_max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_retry_delay_secs: default_connect_retry_delay(),
            discovery_max_backoff_secs: default_discovery_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }

    pub fn discovery_max_backoff(&self) -> Duration {
        Duration::from_secs(self.discovery_max_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_credential_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_credential_timeout(),
        }
    }
}

impl CredentialConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclHookConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// PEM of the RS256 key that signs broker bearer tokens.
    pub token_public_key_pem: String,

    pub issuer: String,

    pub audience: String,

    /// YAML records file backing the relationship check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_path: Option<PathBuf>,
}

fn default_authority_uri() -> String {
    "https://localhost".to_string()
}

fn default_resync_interval() -> u64 {
    24 * 60 * 60
}

fn default_clock_max_backoff() -> u64 {
    32
}

fn default_query_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    300
}

fn default_connect_retry_delay() -> u64 {
    10
}

fn default_discovery_max_backoff() -> u64 {
    16
}

fn default_credential_timeout() -> u64 {
    30
}

fn default_bind_address() -> String {
    "127.0.0.1:8088".to_string()
}

/// `env:VAR` → value of `VAR`; anything else is returned as-is.
pub fn resolve_env_reference(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("Environment variable '{}' referenced by config is not set", var)),
        None => Ok(value.to_string()),
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "agora-node".to_string(),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AGORA_CONFIG_PATH environment variable
    /// 2. ./agora-config.yaml (working directory)
    /// 3. ~/.agora/config.yaml (user home)
    /// 4. /etc/agora/config.yaml (system, Unix) or C:\ProgramData\Agora\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AGORA_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./agora-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".agora").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/agora/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Agora\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var("AGORA_AUTHORITY_URI") {
            tracing::info!("Environment override: AGORA_AUTHORITY_URI={}", uri);
            self.spec.authority.uri = uri;
        }

        if let Ok(host) = std::env::var("AGORA_NTP_HOST") {
            tracing::info!("Environment override: AGORA_NTP_HOST={}", host);
            self.spec.clock.custom_ntp_host = Some(host);
        }

        let host_id = std::env::var("AGORA_HOST_ID").ok();
        let host_secret = std::env::var("AGORA_HOST_SECRET").ok();
        if host_id.is_some() || host_secret.is_some() {
            let host = self.spec.host.get_or_insert_with(|| HostConfig {
                id: String::new(),
                secret: String::new(),
                name: String::new(),
                description: None,
            });
            if let Some(id) = host_id {
                tracing::info!("Environment override: AGORA_HOST_ID={}", id);
                host.id = id;
            }
            if let Some(secret) = host_secret {
                tracing::info!("Environment override: AGORA_HOST_SECRET=<redacted>");
                host.secret = secret;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let authority = url::Url::parse(&self.spec.authority.uri)
            .map_err(|e| anyhow::anyhow!("spec.authority.uri is not a valid URI: {}", e))?;
        if authority.host_str().is_none() {
            anyhow::bail!("spec.authority.uri must include a hostname");
        }
        if let Some(internal) = &self.spec.authority.internal_uri {
            url::Url::parse(internal)
                .map_err(|e| anyhow::anyhow!("spec.authority.internal_uri is not a valid URI: {}", e))?;
        }

        if let Some(host) = &self.spec.host {
            if host.id.is_empty() {
                anyhow::bail!("spec.host.id cannot be empty");
            }
            if host.secret.is_empty() {
                anyhow::bail!("spec.host.secret cannot be empty");
            }
        }

        if let Some(ntp) = &self.spec.clock.custom_ntp_host {
            if !ntp.ends_with("pool.ntp.org") {
                anyhow::bail!("spec.clock.custom_ntp_host must end with 'pool.ntp.org': {}", ntp);
            }
        }

        if self.spec.clock.resync_interval_secs == 0 || self.spec.clock.query_timeout_secs == 0 {
            anyhow::bail!("spec.clock.resync_interval_secs and spec.clock.query_timeout_secs must be greater than zero");
        }

        if self.spec.broker.connect_timeout_secs == 0 {
            anyhow::bail!("spec.broker.connect_timeout_secs must be greater than zero");
        }

        if let Some(hook) = &self.spec.acl_hook {
            if hook.issuer.is_empty() || hook.audience.is_empty() {
                anyhow::bail!("spec.acl_hook.issuer and spec.acl_hook.audience cannot be empty");
            }
            if !hook.token_public_key_pem.contains("BEGIN") {
                anyhow::bail!("spec.acl_hook.token_public_key_pem must be a PEM document");
            }
        }

        Ok(())
    }

    /// Authority id: the hostname of the public authority URI.
    pub fn authority_id(&self) -> anyhow::Result<String> {
        let uri = url::Url::parse(&self.spec.authority.uri)?;
        uri.host_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("spec.authority.uri has no hostname"))
    }
}
