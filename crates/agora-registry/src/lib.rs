//! Cluster membership sourced from an external registry
//!
//! The [`RegistryWatcher`] keeps an in-memory roster tracking whatever
//! authoritative source is plugged in behind [`RosterSource`], and fans
//! out new-node and changed-node notifications to subscribers. The
//! registry is treated as append-mostly: ids that disappear from a
//! snapshot are retained in memory.

mod watcher;

use agora_util_error::BoxedError;
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
pub use watcher::RegistryWatcher;

pub(crate) const LOG_TARGET: &str = "agora::registry";

/// A roster entry as the authoritative source reports it
///
/// Values are taken verbatim, however malformed; validation happens
/// locally, in [`NodeEntry::from_raw`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNodeEntry {
    pub id: u16,
    pub signing_key: Vec<u8>,
    pub address: String,
    pub healthy: bool,
}

/// A roster entry with the locally derived `valid_config` verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: u16,
    pub signing_key: Vec<u8>,
    pub address: String,
    pub healthy: bool,
    /// Pure function of `signing_key` and `address`: the key parses as
    /// ed25519 and the address is an http(s) URL. An entry that fails is
    /// kept in the roster and left for consumers to treat as unhealthy.
    pub valid_config: bool,
}

impl NodeEntry {
    pub fn from_raw(raw: RawNodeEntry) -> Self {
        let valid_config =
            Self::signing_key_parses(&raw.signing_key) && Self::address_is_http(&raw.address);

        Self {
            id: raw.id,
            signing_key: raw.signing_key,
            address: raw.address,
            healthy: raw.healthy,
            valid_config,
        }
    }

    fn signing_key_parses(bytes: &[u8]) -> bool {
        <[u8; 32]>::try_from(bytes)
            .ok()
            .is_some_and(|bytes| VerifyingKey::from_bytes(&bytes).is_ok())
    }

    fn address_is_http(address: &str) -> bool {
        url::Url::parse(address).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }
}

/// Read-only snapshot access to the authoritative registry
///
/// `fetch_roster` must be an idempotent read; the watcher calls it at
/// startup and on every refresh tick, each under its own timeout.
#[async_trait]
pub trait RosterSource: Send + Sync + 'static {
    async fn fetch_roster(&self) -> Result<Vec<RawNodeEntry>, BoxedError>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WatcherStartError {
    #[snafu(display("Refresh interval must be positive"))]
    InvalidRefreshInterval,
    #[snafu(display("Initial roster load failed"))]
    StartupFetch { source: BoxedError },
    #[snafu(display("Initial roster load timed out"))]
    StartupTimeout,
}
pub type WatcherStartResult<T> = std::result::Result<T, WatcherStartError>;
