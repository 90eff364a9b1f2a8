use std::env;
use std::time::Duration;

use crate::model::{Identity, Principal};
use crate::selector::DEFAULT_DEBOUNCE;
use crate::{Error, Result};

pub const ADDR_VAR: &str = "MARKETPLACE_ADDR";
pub const DEBOUNCE_VAR: &str = "MARKETPLACE_SEARCH_DEBOUNCE_MS";
pub const IDENTITY_VAR: &str = "MARKETPLACE_IDENTITY";

/// Client settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Address of a remote backend. `None` runs the embedded in-memory market.
    pub remote_addr: Option<String>,
    pub search_debounce: Duration,
    /// Identity the local auth provider signs in as.
    pub identity: Option<Identity>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_addr: None,
            search_debounce: DEFAULT_DEBOUNCE,
            identity: None,
        }
    }
}

impl ClientConfig {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = ClientConfig::default();

        if let Some(addr) = lookup(ADDR_VAR).filter(|a| !a.trim().is_empty()) {
            config.remote_addr = Some(addr.trim().to_string());
        }
        if let Some(ms) = lookup(DEBOUNCE_VAR) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| Error::Internal(format!("{} must be a whole number of milliseconds, got {:?}", DEBOUNCE_VAR, ms)))?;
            config.search_debounce = Duration::from_millis(ms);
        }
        if let Some(hex) = lookup(IDENTITY_VAR).filter(|h| !h.trim().is_empty()) {
            let principal = Principal::from_hex(hex.trim())
                .map_err(|e| Error::Internal(format!("{} is not a valid principal: {}", IDENTITY_VAR, e)))?;
            config.identity = Some(Identity::authenticated(principal));
        }
        Ok(config)
    }
}
