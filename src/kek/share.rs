//! Sources for KEK share #1.
//!
//! Share #1 of every KEK version lives outside this process, in the
//! key-share service.  The service answers `GET <url>get` with all the
//! items it holds:
//!
//! ```json
//! {"status": "success",
//!  "items": [{"id": "KEK_VER1_PART1", "data": "<64 hex chars>"}]}
//! ```
//!
//! and accepts new items through a form `POST <url>set` with `id` and
//! `data` fields.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::KeyKeeperSettings;
use crate::errors::{CardVaultError, Result};

/// Item id of share #1 for `version`.
pub fn part1_id(version: i32) -> String {
    format!("KEK_VER{version}_PART1")
}

/// Something that can hand out share #1 of a KEK version.
pub trait KeyShareSource: Send {
    /// Hex-encoded share #1 for `version`.
    fn get_key_by_version(&mut self, version: i32) -> Result<String>;

    /// Store share #1 for `version`.
    fn put_key_by_version(&mut self, version: i32, share_hex: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    status: String,
    #[serde(default)]
    items: Vec<KeyItem>,
}

#[derive(Debug, Deserialize)]
struct KeyItem {
    id: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// Client for the remote key-share service.
///
/// Every item a response carries is cached, so each version costs at
/// most one round trip per process.  Failures are not retried.
pub struct KeyKeeperClient {
    base_url: String,
    agent: ureq::Agent,
    cached: HashMap<String, String>,
}

impl KeyKeeperClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            base_url,
            agent: ureq::Agent::new_with_config(config),
            cached: HashMap::new(),
        }
    }

    /// Build a client from the `[key_keeper]` settings, if a URL is set.
    pub fn from_settings(settings: &KeyKeeperSettings) -> Option<Self> {
        settings
            .url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_millis(settings.timeout_ms)))
    }

    fn fetch_items(&mut self) -> Result<()> {
        let url = format!("{}get", self.base_url);
        debug!(%url, "fetching key shares");

        let mut resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| CardVaultError::ConnectivityError(format!("GET {url}: {e}")))?;
        let body: ItemsResponse = resp
            .body_mut()
            .read_json()
            .map_err(|e| CardVaultError::ConnectivityError(format!("GET {url}: bad body: {e}")))?;

        if body.status != "success" {
            return Err(CardVaultError::ConnectivityError(format!(
                "GET {url}: status '{}'",
                body.status
            )));
        }
        for item in body.items {
            self.cached.insert(item.id, item.data);
        }
        Ok(())
    }
}

impl KeyShareSource for KeyKeeperClient {
    fn get_key_by_version(&mut self, version: i32) -> Result<String> {
        let id = part1_id(version);
        if let Some(data) = self.cached.get(&id) {
            return Ok(data.clone());
        }

        self.fetch_items()?;
        self.cached
            .get(&id)
            .cloned()
            .ok_or_else(|| CardVaultError::ConnectivityError(format!("{id} not found")))
    }

    fn put_key_by_version(&mut self, version: i32, share_hex: &str) -> Result<()> {
        let id = part1_id(version);
        let url = format!("{}set", self.base_url);

        let mut resp = self
            .agent
            .post(&url)
            .send_form([("id", id.as_str()), ("data", share_hex)])
            .map_err(|e| CardVaultError::ConnectivityError(format!("POST {url}: {e}")))?;
        let body: StatusResponse = resp
            .body_mut()
            .read_json()
            .map_err(|e| CardVaultError::ConnectivityError(format!("POST {url}: bad body: {e}")))?;

        if body.status != "success" {
            return Err(CardVaultError::ConnectivityError(format!(
                "POST {url}: status '{}'",
                body.status
            )));
        }
        self.cached.insert(id, share_hex.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Shares held in memory; for tests and single-host setups.
#[derive(Debug, Default, Clone)]
pub struct StaticKeyShares {
    shares: HashMap<i32, String>,
}

impl StaticKeyShares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_share(mut self, version: i32, share_hex: impl Into<String>) -> Self {
        self.shares.insert(version, share_hex.into());
        self
    }
}

impl KeyShareSource for StaticKeyShares {
    fn get_key_by_version(&mut self, version: i32) -> Result<String> {
        self.shares
            .get(&version)
            .cloned()
            .ok_or_else(|| CardVaultError::ConnectivityError(format!("{} not found", part1_id(version))))
    }

    fn put_key_by_version(&mut self, version: i32, share_hex: &str) -> Result<()> {
        self.shares.insert(version, share_hex.to_string());
        Ok(())
    }
}
