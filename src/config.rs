// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::fs;
use std::path::Path;
use std::time::Duration;

use ln_rpc::{ClientConfig, LN_NODE_PUB_ENDPOINT, LN_NODE_RPC_ENDPOINT};
use serde_with::DurationMilliSeconds;

use crate::reputation::Settings;

#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
pub enum ConfigError {
    /// unable to read configuration file: {0}
    #[from]
    Io(std::io::Error),

    /// malformed configuration: {0}
    #[from]
    Parse(toml::de::Error),

    /// unable to serialize configuration: {0}
    #[from]
    Serialize(toml::ser::Error),
}

/// Parameters of payment attempts and routing cost model
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", default)]
#[display(Debug)]
pub struct PaymentConfig {
    /// Number of routes tried by a single payment before it fails
    pub max_attempts: u32,

    /// Virtual cost of a failed attempt, used to prefer reliable routes; scaled by the inverse
    /// of the route success probability
    pub attempt_cost_mtokens: u64,

    /// Cost of locking up funds, in parts per billion of the amount per block of timelock
    pub timelock_risk_ppb: u64,

    /// CLTV delta of the final hop used when the payment request does not specify one
    pub final_cltv_delta: u16,

    /// Largest timelock (in blocks above the current height) a route may require
    pub max_timeout_delta: u32,

    /// Blocks added to the final CLTV delta, so a block mined while the payment is in flight
    /// does not make the HTLC expire too soon
    pub cltv_padding: u16,

    /// Timeout of the node calls made by payments and route tests; the connection default applies
    /// when absent
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    #[serde(rename = "call_timeout_ms", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        PaymentConfig {
            max_attempts: 5,
            attempt_cost_mtokens: 100_000,
            timelock_risk_ppb: 15,
            final_cltv_delta: 40,
            max_timeout_delta: 2016,
            cltv_padding: 3,
            call_timeout: None,
        }
    }
}

/// Client configuration. Loaded from a TOML file or constructed explicitly; there is no
/// process-wide state.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Debug)]
pub struct Config {
    /// ZMQ endpoint of the node RPC socket
    pub rpc_endpoint: String,

    /// ZMQ endpoint of the node notification socket
    pub pub_endpoint: String,

    /// Hex-encoded credentials
    #[serde(default)]
    pub macaroon: String,

    /// Default timeout of a single RPC call
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "timeout_ms")]
    pub timeout: Duration,

    /// Delay before lost subscriptions reconnect
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "restart_delay_ms")]
    pub restart_delay: Duration,

    #[serde(default)]
    pub pathfinding: Settings,

    #[serde(default)]
    pub payment: PaymentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_endpoint: LN_NODE_RPC_ENDPOINT.to_owned(),
            pub_endpoint: LN_NODE_PUB_ENDPOINT.to_owned(),
            macaroon: empty!(),
            timeout: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
            pathfinding: default!(),
            payment: default!(),
        }
    }
}

impl Config {
    pub fn from_toml(toml: &str) -> Result<Config, ConfigError> { Ok(toml::from_str(toml)?) }

    pub fn to_toml(&self) -> Result<String, ConfigError> { Ok(toml::to_string(self)?) }

    /// Reads configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        debug!("Loading config file {}", path.display());
        let config = Config::from_toml(&fs::read_to_string(path)?)?;
        trace!("Loaded config {}", config);
        Ok(config)
    }

    /// Parameters of the ZMQ connection to the node
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            rpc_endpoint: self.rpc_endpoint.clone(),
            pub_endpoint: self.pub_endpoint.clone(),
            macaroon: self.macaroon.clone(),
            timeout: self.timeout,
            restart_delay: self.restart_delay,
        }
    }
}
