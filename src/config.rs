use crate::{
    address::{
        Address,
        Wei,
    },
    snapshot::FieldGroup,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";
pub const DEFAULT_RELAY_URL: &str = "http://localhost:3000/api/paymaster";
/// 0.001 ETH.
pub const DEFAULT_ENTRY_FEE_WEI: Wei = 1_000_000_000_000_000;
pub const DEFAULT_ETH_USD_PRICE: f64 = 2500.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-group read cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,
    #[serde(default = "default_slow_interval_ms")]
    pub slow_interval_ms: u64,
    /// Reads still outstanding after this long count as transient failures.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_fast_interval_ms() -> u64 {
    1_000
}

fn default_slow_interval_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: default_fast_interval_ms(),
            slow_interval_ms: default_slow_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self, group: FieldGroup) -> Duration {
        if group.is_fast() {
            Duration::from_millis(self.fast_interval_ms)
        } else {
            Duration::from_millis(self.slow_interval_ms)
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_poll_ms")]
    pub poll_interval_ms: u64,
    /// Blocks on top of (and including) the receipt's block before it counts as final.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest wait for the relay to accept or reject an action.
    #[serde(default = "default_relay_timeout_secs")]
    pub relay_timeout_secs: u64,
}

fn default_confirmation_poll_ms() -> u64 {
    2_000
}

fn default_confirmations() -> u64 {
    1
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

fn default_relay_timeout_secs() -> u64 {
    30
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_confirmation_poll_ms(),
            confirmations: default_confirmations(),
            timeout_secs: default_confirmation_timeout_secs(),
            relay_timeout_secs: default_relay_timeout_secs(),
        }
    }
}

impl ConfirmationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub rpc_url: Url,
    pub contract: Address,
    pub relay_url: Url,
    /// Account whose queue entries are highlighted and on whose behalf actions are sent.
    #[serde(default)]
    pub viewer: Option<Address>,
    #[serde(default = "default_entry_fee")]
    pub entry_fee_wei: Wei,
    #[serde(default = "default_eth_usd_price")]
    pub eth_usd_price: f64,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

fn default_entry_fee() -> Wei {
    DEFAULT_ENTRY_FEE_WEI
}

fn default_eth_usd_price() -> f64 {
    DEFAULT_ETH_USD_PRICE
}

impl ClientConfig {
    pub fn new(rpc_url: Url, contract: Address, relay_url: Url) -> Self {
        Self {
            rpc_url,
            contract,
            relay_url,
            viewer: None,
            entry_fee_wei: DEFAULT_ENTRY_FEE_WEI,
            eth_usd_price: DEFAULT_ETH_USD_PRICE,
            polling: PollingConfig::default(),
            confirmation: ConfirmationConfig::default(),
        }
    }

    /// Reads a JSON config file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ClientConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contract.is_zero() {
            return Err(ConfigError::Invalid(
                "contract address must not be the zero address".to_string(),
            ));
        }
        if self.polling.fast_interval_ms == 0 || self.polling.slow_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling intervals must be greater than zero".to_string(),
            ));
        }
        if self.confirmation.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "confirmation poll interval must be greater than zero".to_string(),
            ));
        }
        if self.confirmation.relay_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "relay timeout must be greater than zero".to_string(),
            ));
        }
        if !self.eth_usd_price.is_finite() || self.eth_usd_price < 0.0 {
            return Err(ConfigError::Invalid(
                "eth_usd_price must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::io::Write;

    fn contract() -> Address {
        Address::new([0x11; 20])
    }

    #[test]
    fn polling_config__fast_group_uses_fast_interval() {
        let polling = PollingConfig::default();
        assert_eq!(
            polling.interval(FieldGroup::TimeRemaining),
            Duration::from_secs(1)
        );
        assert_eq!(polling.interval(FieldGroup::Queue), Duration::from_secs(5));
        assert_eq!(polling.interval(FieldGroup::GameEnded), Duration::from_secs(5));
    }

    #[test]
    fn load__fills_defaults_for_missing_sections() {
        // given
        let path = std::env::temp_dir().join(format!(
            "send-one-config-{}.json",
            std::process::id()
        ));
        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "rpc_url": "http://localhost:8545",
                "contract": "0x1111111111111111111111111111111111111111",
                "relay_url": "http://localhost:3000/api/paymaster"
            }}"#
        )
        .unwrap();

        // when
        let config = ClientConfig::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        // then
        assert_eq!(config.contract, contract());
        assert_eq!(config.entry_fee_wei, DEFAULT_ENTRY_FEE_WEI);
        assert_eq!(config.polling, PollingConfig::default());
        assert_eq!(config.confirmation.confirmations, 1);
        assert_eq!(config.confirmation.relay_timeout(), Duration::from_secs(30));
        assert_eq!(config.viewer, None);
    }

    #[test]
    fn validate__rejects_zero_contract_and_zero_intervals() {
        // given
        let rpc = Url::parse("http://localhost:8545").unwrap();
        let relay = Url::parse("http://localhost:3000").unwrap();
        let zero_contract = ClientConfig::new(rpc.clone(), Address::ZERO, relay.clone());
        let mut zero_interval = ClientConfig::new(rpc, contract(), relay);
        zero_interval.polling.fast_interval_ms = 0;

        // then
        assert!(matches!(
            zero_contract.validate(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            zero_interval.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load__missing_file_is_read_error() {
        let err = ClientConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
