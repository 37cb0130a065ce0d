//! Per-pass credential resolution across BYOK and managed keys.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::ManagedKeys;
use crate::domain::{CredentialMode, ResolvedCredential};
use crate::secrets::{SecretError, SecretStore};
use crate::store::RunStore;

/// Picks the credential used for one provider call.
///
/// Nothing is cached: every pass resolves again, so a key stored or disabled
/// mid-run takes effect on the next pass.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn RunStore>,
    secrets: Option<Arc<SecretStore>>,
    managed: ManagedKeys,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<dyn RunStore>,
        secrets: Option<Arc<SecretStore>>,
        managed: ManagedKeys,
    ) -> Self {
        Self {
            store,
            secrets,
            managed,
        }
    }

    /// Resolve a credential for `provider`. A missing key is `Ok` with no
    /// secret; only storage failures are errors.
    pub fn resolve(
        &self,
        provider: &str,
        requested: Option<CredentialMode>,
    ) -> Result<ResolvedCredential> {
        let provider = provider.trim().to_ascii_lowercase();

        let resolved = match requested.unwrap_or_default() {
            CredentialMode::Managed => self.managed(&provider),
            CredentialMode::Byok => {
                ResolvedCredential::new(CredentialMode::Byok, self.byok(&provider)?)
            }
            CredentialMode::Auto => match self.byok(&provider)? {
                Some(secret) => ResolvedCredential::new(CredentialMode::Byok, Some(secret)),
                None => self.managed(&provider),
            },
        };

        debug!(
            provider = %provider,
            mode = %resolved.mode,
            available = resolved.is_available(),
            "Resolved credential"
        );
        Ok(resolved)
    }

    /// Decrypt the stored key for `provider`
    pub fn stored_secret(&self, provider: &str) -> Result<Result<String, SecretError>> {
        let provider = provider.trim().to_ascii_lowercase();
        let Some(key) = self.store.provider_key(&provider)? else {
            return Ok(Err(SecretError::NotFound));
        };
        if !key.enabled {
            return Ok(Err(SecretError::Disabled));
        }
        let Some(secrets) = &self.secrets else {
            return Ok(Err(SecretError::InvalidMasterKey("not configured".to_string())));
        };
        Ok(secrets.decrypt(&key.key_ciphertext))
    }

    fn byok(&self, provider: &str) -> Result<Option<String>> {
        match self.stored_secret(provider)? {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NotFound) | Err(SecretError::Disabled) => Ok(None),
            Err(e) => {
                warn!(provider = %provider, error = %e, "Stored key unusable");
                Ok(None)
            }
        }
    }

    fn managed(&self, provider: &str) -> ResolvedCredential {
        ResolvedCredential::new(
            CredentialMode::Managed,
            self.managed.get(provider).map(str::to_string),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderKey;
    use crate::store::SqliteStore;

    fn setup() -> (Arc<SqliteStore>, Arc<SecretStore>) {
        (
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(SecretStore::from_key([3u8; 32])),
        )
    }

    fn store_key(store: &SqliteStore, secrets: &SecretStore, provider: &str, secret: &str) {
        let key = ProviderKey::new(provider, secrets.encrypt(secret).unwrap());
        store.upsert_provider_key(&key).unwrap();
    }

    #[test]
    fn test_auto_prefers_stored_key() {
        let (store, secrets) = setup();
        store_key(&store, &secrets, "openai", "sk-user");
        let resolver = CredentialResolver::new(
            store,
            Some(secrets),
            ManagedKeys::new().with("openai", "sk-managed"),
        );

        let cred = resolver.resolve("OpenAI", None).unwrap();
        assert_eq!(cred.mode, CredentialMode::Byok);
        assert_eq!(cred.secret.as_deref(), Some("sk-user"));
    }

    #[test]
    fn test_auto_falls_back_to_managed() {
        let (store, secrets) = setup();
        let resolver = CredentialResolver::new(
            store,
            Some(secrets),
            ManagedKeys::new().with("xai", "xai-managed"),
        );

        let cred = resolver.resolve("xai", Some(CredentialMode::Auto)).unwrap();
        assert_eq!(cred.mode, CredentialMode::Managed);
        assert_eq!(cred.secret.as_deref(), Some("xai-managed"));

        let none = resolver.resolve("gemini", None).unwrap();
        assert_eq!(none.mode, CredentialMode::Managed);
        assert!(!none.is_available());
    }

    #[test]
    fn test_disabled_key_is_unavailable() {
        let (store, secrets) = setup();
        let mut key = ProviderKey::new("anthropic", secrets.encrypt("sk-ant").unwrap());
        key.enabled = false;
        store.upsert_provider_key(&key).unwrap();

        let resolver = CredentialResolver::new(store, Some(secrets), ManagedKeys::new());
        assert!(matches!(
            resolver.stored_secret("anthropic").unwrap(),
            Err(SecretError::Disabled)
        ));

        let cred = resolver.resolve("anthropic", Some(CredentialMode::Byok)).unwrap();
        assert_eq!(cred.mode, CredentialMode::Byok);
        assert!(!cred.is_available());
    }

    #[test]
    fn test_foreign_ciphertext_is_a_decrypt_failure() {
        let (store, secrets) = setup();
        let other = SecretStore::from_key([9u8; 32]);
        store_key(&store, &other, "openai", "sk-other");

        let resolver = CredentialResolver::new(
            store,
            Some(secrets),
            ManagedKeys::new().with("openai", "sk-managed"),
        );
        assert!(matches!(
            resolver.stored_secret("openai").unwrap(),
            Err(SecretError::Decrypt)
        ));
        assert!(matches!(
            resolver.stored_secret("gemini").unwrap(),
            Err(SecretError::NotFound)
        ));

        let cred = resolver.resolve("openai", None).unwrap();
        assert_eq!(cred.mode, CredentialMode::Managed);
        assert_eq!(cred.secret.as_deref(), Some("sk-managed"));
    }

    #[test]
    fn test_managed_mode_ignores_stored_key() {
        let (store, secrets) = setup();
        store_key(&store, &secrets, "deepseek", "sk-user");
        let resolver = CredentialResolver::new(store, Some(secrets), ManagedKeys::new());

        let cred = resolver
            .resolve("deepseek", Some(CredentialMode::Managed))
            .unwrap();
        assert_eq!(cred.mode, CredentialMode::Managed);
        assert!(!cred.is_available());
    }
}
