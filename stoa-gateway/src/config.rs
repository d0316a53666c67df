//! Gateway configuration.
//!
//! Loads configuration from a TOML file with support for environment
//! variable expansion in string values. Variables use `$VAR` or `${VAR}`
//! syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 3001
//! public_base_url = "https://gateway.stoa.example"
//!
//! [facilitator]
//! url = "https://api.cdp.coinbase.com/platform/v2/x402"
//! network = "eip155:84532"
//! timeout_secs = 10
//!
//! [embeddings]
//! url = "https://router.huggingface.co/hf-inference/models/nomic-ai/nomic-embed-text-v1.5/pipeline/feature-extraction"
//! auth_token = "$HF_TOKEN"
//! dimensions = 768
//!
//! [dispatch]
//! timeout_secs = 30
//!
//! [limits.search]
//! max_requests = 30
//! window_secs = 60
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — Path to configuration file (default: `config.toml`)
//! - `HOST` / `PORT` — Override server bind address and port
//! - Secrets referenced by `$VAR` in the config file (e.g. `HF_TOKEN`)

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `3001`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible base URL, used to build the resource URLs
    /// embedded in payment challenges. Falls back to the request's `Host`
    /// header when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Block-explorer transaction URL prefix for settled calls.
    #[serde(default = "default_explorer_tx_base")]
    pub explorer_tx_base: String,

    /// Payment facilitator settings.
    #[serde(default)]
    pub facilitator: FacilitatorConfig,

    /// Text-to-vector collaborator settings.
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    /// Provider dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-route rate limit budgets.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Payment facilitator client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    /// Base URL of the facilitator.
    #[serde(default = "default_facilitator_url")]
    pub url: String,

    /// CAIP-2 network payments settle on.
    #[serde(default = "default_network")]
    pub network: String,

    /// Override for the USDC asset address. When unset, the well-known
    /// address for `network` is used.
    #[serde(default)]
    pub asset: Option<String>,

    /// Per-request timeout for verify/settle calls, in seconds.
    #[serde(default = "default_facilitator_timeout")]
    pub timeout_secs: u64,

    /// Validity window advertised in payment challenges, in seconds.
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_secs: u64,
}

/// Text-to-vector collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// Feature-extraction endpoint URL.
    #[serde(default = "default_embeddings_url")]
    pub url: String,

    /// Optional bearer token. Supports `$VAR` expansion.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Expected embedding vector length.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_embeddings_timeout")]
    pub timeout_secs: u64,
}

/// Provider dispatch settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Outbound call timeout, in seconds. Must be finite and non-zero.
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
}

/// One fixed-window rate budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateBudget {
    /// Maximum admitted requests per window.
    pub max_requests: u32,

    /// Window length, in seconds.
    pub window_secs: u64,
}

impl RateBudget {
    /// Window length as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-route-class rate budgets, each an isolated keyspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Discovery routes (`/search`).
    #[serde(default = "default_search_budget")]
    pub search: RateBudget,

    /// Dispatch routes (`/services/{id}/call`).
    #[serde(default = "default_call_budget")]
    pub call: RateBudget,

    /// Catalog read/registration routes.
    #[serde(default = "default_registry_budget")]
    pub registry: RateBudget,

    /// Interval between sweeps of expired windows, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl GatewayConfig {
    /// Loads configuration from the path given by the `CONFIG` environment
    /// variable, falling back to `config.toml` in the current directory.
    ///
    /// After loading, all string values with `$VAR` / `${VAR}` references
    /// are expanded from the process environment. `HOST` and `PORT` env
    /// vars override the file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "config.toml".to_owned());
        Self::load_from(&path)
    }

    /// Loads configuration from a specific file path. A missing file is
    /// treated as an empty one, so every field takes its default.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = if Path::new(path).exists() {
            std::fs::read_to_string(path)?
        } else {
            String::new()
        };

        let expanded = expand_env_vars(&content);
        let mut config: Self = toml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("HOST") {
            if let Ok(addr) = host.parse() {
                config.host = addr;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                config.port = p;
            }
        }

        Ok(config)
    }

    /// Resolves the USDC asset address for the configured network.
    ///
    /// # Errors
    ///
    /// Fails when the network has no well-known USDC deployment and no
    /// explicit `facilitator.asset` override was given.
    pub fn usdc_asset(&self) -> Result<String, Box<dyn std::error::Error>> {
        if let Some(asset) = &self.facilitator.asset {
            return Ok(asset.clone());
        }
        known_usdc_asset(&self.facilitator.network)
            .map(str::to_owned)
            .ok_or_else(|| {
                format!(
                    "no known USDC asset for network {}; set facilitator.asset",
                    self.facilitator.network
                )
                .into()
            })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            url: default_facilitator_url(),
            network: default_network(),
            asset: None,
            timeout_secs: default_facilitator_timeout(),
            challenge_timeout_secs: default_challenge_timeout(),
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            url: default_embeddings_url(),
            auth_token: None,
            dimensions: default_dimensions(),
            timeout_secs: default_embeddings_timeout(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            search: default_search_budget(),
            call: default_call_budget(),
            registry: default_registry_budget(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Well-known USDC contract addresses by CAIP-2 network.
#[must_use]
pub fn known_usdc_asset(network: &str) -> Option<&'static str> {
    match network {
        "eip155:84532" => Some("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
        "eip155:8453" => Some("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
        _ => None,
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    3001
}

fn default_explorer_tx_base() -> String {
    "https://sepolia.basescan.org/tx/".to_owned()
}

fn default_facilitator_url() -> String {
    "https://api.cdp.coinbase.com/platform/v2/x402".to_owned()
}

fn default_network() -> String {
    "eip155:84532".to_owned()
}

const fn default_facilitator_timeout() -> u64 {
    10
}

const fn default_challenge_timeout() -> u64 {
    60
}

fn default_embeddings_url() -> String {
    "https://router.huggingface.co/hf-inference/models/nomic-ai/nomic-embed-text-v1.5/pipeline/feature-extraction".to_owned()
}

const fn default_dimensions() -> usize {
    768
}

const fn default_embeddings_timeout() -> u64 {
    15
}

const fn default_dispatch_timeout() -> u64 {
    30
}

const fn default_search_budget() -> RateBudget {
    RateBudget {
        max_requests: 30,
        window_secs: 60,
    }
}

const fn default_call_budget() -> RateBudget {
    RateBudget {
        max_requests: 60,
        window_secs: 60,
    }
}

const fn default_registry_budget() -> RateBudget {
    RateBudget {
        max_requests: 100,
        window_secs: 60,
    }
}

const fn default_sweep_interval() -> u64 {
    300
}

/// Expands `$VAR` and `${VAR}` patterns in a string from environment
/// variables. Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            let braced = chars.peek() == Some(&'{');
            if braced {
                chars.next();
            }

            let mut var_name = String::new();
            while let Some(&c) = chars.peek() {
                if braced {
                    if c == '}' {
                        chars.next();
                        break;
                    }
                } else if !c.is_ascii_alphanumeric() && c != '_' {
                    break;
                }
                var_name.push(c);
                chars.next();
            }

            if var_name.is_empty() {
                result.push('$');
                if braced {
                    result.push('{');
                }
            } else if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            } else {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&var_name);
                if braced {
                    result.push('}');
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_takes_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.facilitator.network, "eip155:84532");
        assert_eq!(config.embeddings.dimensions, 768);
        assert_eq!(config.limits.search.max_requests, 30);
        assert_eq!(config.limits.call.max_requests, 60);
        assert_eq!(config.dispatch.timeout_secs, 30);
    }

    #[test]
    fn resolves_known_usdc_asset() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.usdc_asset().unwrap(),
            "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
        );

        let mut custom = config;
        custom.facilitator.network = "eip155:31337".into();
        assert!(custom.usdc_asset().is_err());
        custom.facilitator.asset = Some("0xLocalUsdc".into());
        assert_eq!(custom.usdc_asset().unwrap(), "0xLocalUsdc");
    }

    #[test]
    #[allow(unsafe_code)]
    fn expands_env_vars() {
        // SAFETY: test-local env mutation
        unsafe { std::env::set_var("STOA_TEST_TOKEN", "tok-123") };
        let expanded = expand_env_vars("auth_token = \"$STOA_TEST_TOKEN\"");
        assert_eq!(expanded, "auth_token = \"tok-123\"");
        let untouched = expand_env_vars("value = \"$STOA_UNSET_VAR\"");
        assert_eq!(untouched, "value = \"$STOA_UNSET_VAR\"");
    }

    #[test]
    fn parses_partial_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            port = 8080

            [limits.search]
            max_requests = 5
            window_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.limits.search.max_requests, 5);
        assert_eq!(config.limits.call.max_requests, 60);
    }
}
