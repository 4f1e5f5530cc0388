//! Forwarder settings, which are configurable using environment variables.
use crate::config::get_config;
use crate::types::{CalledAETitle, CallingAETitle};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Calling/called identity and network address of the peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    /// Our AE title.
    #[serde(default = "default_aet")]
    pub aet: CallingAETitle,
    /// AE title of the peer.
    pub aec: CalledAETitle,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Endpoint {
    pub fn new(
        aet: impl Into<CallingAETitle>,
        aec: impl Into<CalledAETitle>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            aet: aet.into(),
            aec: aec.into(),
            host: host.into(),
            port,
        }
    }

    /// Address in the form `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.aec, self.host, self.port)
    }
}

/// Connection and negotiation tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardOptions {
    /// Maximum PDU length we are willing to receive.
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,
    /// Whether received PDUs must not surpass the negotiated maximum PDU length.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on the A-RELEASE and A-ABORT exchanges when closing.
    #[serde(default = "default_close_timeout", with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Quiet period after which an unused association is released.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Interval between checks for pending transfers before a renegotiation.
    #[serde(default = "default_wait_sleep", with = "humantime_serde")]
    pub wait_sleep: Duration,
    /// How many times to check for pending transfers before closing anyway.
    #[serde(default = "default_max_wait_loops")]
    pub max_wait_loops: u32,
    /// Propose SOP class relationship negotiation for every abstract syntax.
    #[serde(default)]
    pub relationship_negotiation: bool,
}

/// Default interval between two checks for pending transfers.
pub const WAIT_SLEEP_MS: u64 = 20;

/// Default number of checks for pending transfers.
pub const MAX_WAIT_LOOPS: u32 = 3000;

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            max_pdu_length: default_max_pdu_length(),
            strict: false,
            connect_timeout: default_connect_timeout(),
            close_timeout: default_close_timeout(),
            idle_timeout: default_idle_timeout(),
            wait_sleep: default_wait_sleep(),
            max_wait_loops: default_max_wait_loops(),
            relationship_negotiation: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderSettings {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub options: ForwardOptions,
}

impl ForwarderSettings {
    /// Read settings from `OXIFORWARD_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, figment::Error> {
        get_config().extract()
    }
}

fn default_aet() -> CallingAETitle {
    CallingAETitle::from_static("OXIFORWARD")
}

fn default_port() -> u16 {
    104
}

fn default_max_pdu_length() -> u32 {
    16384
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_wait_sleep() -> Duration {
    Duration::from_millis(WAIT_SLEEP_MS)
}

fn default_max_wait_loops() -> u32 {
    MAX_WAIT_LOOPS
}
