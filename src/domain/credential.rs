//! Credential modes and resolved provider credentials.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Requested (or used) credential source for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// The user's own stored key ("bring your own key")
    Byok,

    /// The platform-configured key
    Managed,

    /// BYOK when usable, otherwise managed
    Auto,
}

impl CredentialMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Byok => "byok",
            Self::Managed => "managed",
            Self::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "byok" => Some(Self::Byok),
            "managed" => Some(Self::Managed),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

impl Default for CredentialMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential picked for one pass. Never cached across passes.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    /// Mode actually used (`Byok` or `Managed`, never `Auto`)
    pub mode: CredentialMode,

    /// Secret value, if one was available
    pub secret: Option<String>,
}

impl ResolvedCredential {
    pub fn new(mode: CredentialMode, secret: Option<String>) -> Self {
        Self { mode, secret }
    }

    pub fn is_available(&self) -> bool {
        self.secret.is_some()
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("mode", &self.mode)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A stored, encrypted BYOK key
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderKey {
    pub id: Uuid,

    /// Ownership scope ("user") and owner id ("local")
    pub scope: String,
    pub scope_id: String,

    pub provider: String,
    pub enabled: bool,

    /// Ciphertext produced by the secret store
    pub key_ciphertext: String,

    pub created_at: DateTime<Utc>,
}

impl ProviderKey {
    /// Single-user scope used by the local deployment
    pub const USER_SCOPE: &'static str = "user";
    pub const LOCAL_SCOPE_ID: &'static str = "local";

    pub fn new(provider: impl Into<String>, key_ciphertext: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: Self::USER_SCOPE.to_string(),
            scope_id: Self::LOCAL_SCOPE_ID.to_string(),
            provider: provider.into().to_ascii_lowercase(),
            enabled: true,
            key_ciphertext,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKey")
            .field("provider", &self.provider)
            .field("scope", &self.scope)
            .field("scope_id", &self.scope_id)
            .field("enabled", &self.enabled)
            .field("key_ciphertext", &"[REDACTED]")
            .finish()
    }
}
