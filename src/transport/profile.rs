//! Broker address parsing and environment-adaptive connection tuning
//!
//! Brokers reached through a constrained TCP proxy (managed PaaS networking)
//! drop idle connections early and accept handshakes slowly, so they get a
//! shorter heartbeat, a shorter blocked-connection bound and a longer socket
//! timeout than a directly reachable broker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Host fragments that identify a constrained-proxy deployment
pub const CONSTRAINED_PROXY_HOST_PATTERNS: &[&str] = &["railway.internal", "rlwy.net"];

#[derive(Debug, Error, PartialEq)]
pub enum AddressError {
    #[error("broker address is not a valid URI")]
    Unparseable,
    #[error("unsupported broker scheme '{0}', expected amqp or amqps")]
    UnsupportedScheme(String),
    #[error("broker address has no host")]
    MissingHost,
}

/// Broker connection string
///
/// Carries credentials, so neither `Display` nor `Debug` print it in full.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    raw: String,
    scheme: String,
    host: String,
    port: u16,
}

impl BrokerAddress {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let url = Url::parse(raw).map_err(|_| AddressError::Unparseable)?;
        let scheme = url.scheme().to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "amqp" => 5672,
            "amqps" => 5671,
            _ => return Err(AddressError::UnsupportedScheme(scheme)),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(AddressError::MissingHost)?
            .to_string();

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            port: url.port().unwrap_or(default_port),
            host,
        })
    }

    /// Full connection string including credentials; hand only to the client library
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uses_tls(&self) -> bool {
        self.scheme == "amqps"
    }

    /// `scheme://***@host:port`
    pub fn redacted(&self) -> String {
        format!("{}://***@{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BrokerAddress").field(&self.redacted()).finish()
    }
}

/// Deployment environment of the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrokerEnvironment {
    ConstrainedProxy,
    Direct,
}

impl BrokerEnvironment {
    /// Classify by host substring
    pub fn classify(address: &BrokerAddress) -> Self {
        let host = address.host().to_ascii_lowercase();
        if CONSTRAINED_PROXY_HOST_PATTERNS
            .iter()
            .any(|pattern| host.contains(pattern))
        {
            BrokerEnvironment::ConstrainedProxy
        } else {
            BrokerEnvironment::Direct
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerEnvironment::ConstrainedProxy => "constrained-proxy",
            BrokerEnvironment::Direct => "direct",
        }
    }
}

impl fmt::Display for BrokerEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constrained-proxy" | "constrained_proxy" | "railway" => {
                Ok(BrokerEnvironment::ConstrainedProxy)
            }
            "direct" | "local" => Ok(BrokerEnvironment::Direct),
            other => Err(format!(
                "unknown broker environment '{other}', expected constrained-proxy or direct"
            )),
        }
    }
}

/// Tuning parameters for one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub environment: BrokerEnvironment,
    pub heartbeat: Duration,
    /// Bound on how long a publisher waits on a blocked broker for its confirm
    pub blocked_connection_timeout: Duration,
    /// Bound on each TCP/AMQP handshake attempt
    pub socket_timeout: Duration,
    /// Handshake attempts inside a single open
    pub connection_attempts: u32,
    pub retry_delay: Duration,
    pub use_tls: bool,
}

impl ConnectionProfile {
    /// Derive the profile for an address, honouring an explicit environment override
    pub fn resolve(address: &BrokerAddress, environment: Option<BrokerEnvironment>) -> Self {
        let environment = environment.unwrap_or_else(|| BrokerEnvironment::classify(address));
        let profile = match environment {
            BrokerEnvironment::ConstrainedProxy => Self::constrained_proxy(),
            BrokerEnvironment::Direct => Self::direct(),
        };
        Self {
            use_tls: address.uses_tls(),
            ..profile
        }
    }

    pub fn constrained_proxy() -> Self {
        Self {
            environment: BrokerEnvironment::ConstrainedProxy,
            heartbeat: Duration::from_secs(30),
            blocked_connection_timeout: Duration::from_secs(120),
            socket_timeout: Duration::from_secs(15),
            connection_attempts: 5,
            retry_delay: Duration::from_secs(2),
            use_tls: false,
        }
    }

    pub fn direct() -> Self {
        Self {
            environment: BrokerEnvironment::Direct,
            heartbeat: Duration::from_secs(60),
            blocked_connection_timeout: Duration::from_secs(600),
            socket_timeout: Duration::from_secs(10),
            connection_attempts: 3,
            retry_delay: Duration::from_secs(1),
            use_tls: false,
        }
    }

    /// Heartbeat in the unit AMQP negotiates
    pub fn heartbeat_secs(&self) -> u16 {
        u16::try_from(self.heartbeat.as_secs()).unwrap_or(u16::MAX)
    }
}
