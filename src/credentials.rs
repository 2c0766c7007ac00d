//! Read-only access to the bearer credential stored by the host.
//!
//! The host application owns credential storage (it writes the token after
//! login and rotates it on refresh). This crate only ever reads it, and does
//! so again on every connection attempt so a rotated token is picked up by
//! the next reconnect.
//!
//! # Sources
//!
//! - [`SharedCredential`] - in-memory slot the embedding application updates
//! - [`EnvCredential`] - environment variable (CI, headless runs)
//! - [`KeyringCredential`] - OS keyring entry written by the host
//! - [`ChainedCredential`] - first source that yields a token wins

use std::sync::{Arc, PoisonError, RwLock};

use keyring::Entry;

/// Default keyring service name.
pub const KEYRING_SERVICE: &str = "inventory-notifier";
/// Default keyring entry holding the access token.
pub const KEYRING_ACCESS_TOKEN: &str = "access-token";
/// Default environment variable holding the access token.
pub const TOKEN_ENV_VAR: &str = "INVNOTIFY_TOKEN";

/// Something that can hand out the current bearer credential.
///
/// Returning `None` means "no credential stored"; the supervisor treats that
/// like an invalid credential and stops retrying.
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    /// Read the current credential.
    fn current(&self) -> Option<String>;
}

/// In-memory credential slot, cloneable and shared with the host.
#[derive(Debug, Clone, Default)]
pub struct SharedCredential {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedCredential {
    /// Create a slot holding `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        let shared = Self::default();
        shared.set(token);
        shared
    }

    /// Replace the stored credential (login or token refresh).
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Remove the stored credential (logout).
    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl CredentialSource for SharedCredential {
    fn current(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Credential read from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    /// Read from the given variable.
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredential {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

impl CredentialSource for EnvCredential {
    fn current(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Credential read from an OS keyring entry.
#[derive(Debug, Clone)]
pub struct KeyringCredential {
    service: String,
    user: String,
}

impl KeyringCredential {
    /// Read from `service`/`user`.
    #[must_use]
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

impl Default for KeyringCredential {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_ACCESS_TOKEN)
    }
}

impl CredentialSource for KeyringCredential {
    fn current(&self) -> Option<String> {
        let entry = match Entry::new(&self.service, &self.user) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[Credentials] Failed to open keyring entry: {e:?}");
                return None;
            }
        };

        match entry.get_password() {
            Ok(token) if !token.trim().is_empty() => Some(token),
            Ok(_) | Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("[Credentials] Keyring read failed: {e:?}");
                None
            }
        }
    }
}

/// Tries each source in order and returns the first credential found.
#[derive(Debug, Default)]
pub struct ChainedCredential {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainedCredential {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source to the chain.
    #[must_use]
    pub fn with(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl CredentialSource for ChainedCredential {
    fn current(&self) -> Option<String> {
        self.sources.iter().find_map(|source| source.current())
    }
}
