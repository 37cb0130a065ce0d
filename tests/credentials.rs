//! Credential Integration Tests
//!
//! Tests for BYOK / managed resolution against a real store and cipher.

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use chriseon::config::ManagedKeys;
use chriseon::core::CredentialResolver;
use chriseon::domain::{CredentialMode, ProviderKey};
use chriseon::secrets::{SecretError, SecretStore};
use chriseon::store::{RunStore, SqliteStore};

struct Fixture {
    store: Arc<SqliteStore>,
    secrets: Arc<SecretStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            secrets: Arc::new(SecretStore::from_key([11u8; 32])),
        }
    }

    fn store_key(&self, provider: &str, secret: &str) -> ProviderKey {
        let key = ProviderKey::new(provider, self.secrets.encrypt(secret).unwrap());
        self.store.upsert_provider_key(&key).unwrap();
        key
    }

    fn resolver(&self, managed: ManagedKeys) -> CredentialResolver {
        CredentialResolver::new(self.store.clone(), Some(self.secrets.clone()), managed)
    }
}

#[test]
fn test_resolution_is_deterministic() {
    let fx = Fixture::new();
    fx.store_key("openai", "sk-user-openai");
    let resolver = fx.resolver(
        ManagedKeys::new()
            .with("openai", "sk-managed-openai")
            .with("xai", "sk-managed-xai"),
    );

    for _ in 0..3 {
        let auto = assert_ok!(resolver.resolve("openai", None));
        assert_eq!(auto.mode, CredentialMode::Byok);
        assert_eq!(auto.secret.as_deref(), Some("sk-user-openai"));

        let managed = assert_ok!(resolver.resolve("openai", Some(CredentialMode::Managed)));
        assert_eq!(managed.mode, CredentialMode::Managed);
        assert_eq!(managed.secret.as_deref(), Some("sk-managed-openai"));

        let fallback = assert_ok!(resolver.resolve("xai", Some(CredentialMode::Auto)));
        assert_eq!(fallback.mode, CredentialMode::Managed);
        assert_eq!(fallback.secret.as_deref(), Some("sk-managed-xai"));
    }
}

#[test]
fn test_byok_without_stored_key_is_unavailable() {
    let fx = Fixture::new();
    let resolver = fx.resolver(ManagedKeys::new().with("anthropic", "sk-managed"));

    let resolved = assert_ok!(resolver.resolve("anthropic", Some(CredentialMode::Byok)));
    assert_eq!(resolved.mode, CredentialMode::Byok);
    assert!(!resolved.is_available());
}

#[test]
fn test_auto_with_nothing_configured_is_managed_without_secret() {
    let fx = Fixture::new();
    let resolver = fx.resolver(ManagedKeys::new());

    let resolved = assert_ok!(resolver.resolve("openai", None));
    assert_eq!(resolved.mode, CredentialMode::Managed);
    assert_eq!(resolved.secret, None);
}

#[test]
fn test_provider_names_are_case_insensitive() {
    let fx = Fixture::new();
    fx.store_key("Gemini", "sk-user-gemini");
    let resolver = fx.resolver(ManagedKeys::new());

    let resolved = assert_ok!(resolver.resolve("GEMINI", None));
    assert_eq!(resolved.secret.as_deref(), Some("sk-user-gemini"));
}

#[test]
fn test_disabled_key_falls_back_to_managed() {
    let fx = Fixture::new();
    let mut key = fx.store_key("openai", "sk-user");
    key.enabled = false;
    fx.store.upsert_provider_key(&key).unwrap();

    let resolver = fx.resolver(ManagedKeys::new().with("openai", "sk-managed"));
    assert_eq!(
        assert_ok!(resolver.stored_secret("openai")),
        Err(SecretError::Disabled)
    );

    let resolved = assert_ok!(resolver.resolve("openai", None));
    assert_eq!(resolved.mode, CredentialMode::Managed);
    assert_eq!(resolved.secret.as_deref(), Some("sk-managed"));
}

#[test]
fn test_foreign_ciphertext_is_distinct_from_missing() {
    let fx = Fixture::new();
    let other = SecretStore::from_key([12u8; 32]);
    let key = ProviderKey::new("deepseek", other.encrypt("sk-foreign").unwrap());
    fx.store.upsert_provider_key(&key).unwrap();

    let resolver = fx.resolver(ManagedKeys::new().with("deepseek", "sk-managed"));

    assert_eq!(
        assert_ok!(resolver.stored_secret("deepseek")),
        Err(SecretError::Decrypt)
    );
    assert_eq!(
        assert_ok!(resolver.stored_secret("openai")),
        Err(SecretError::NotFound)
    );

    // An undecryptable key counts as unavailable
    let resolved = assert_ok!(resolver.resolve("deepseek", None));
    assert_eq!(resolved.mode, CredentialMode::Managed);
    assert_eq!(resolved.secret.as_deref(), Some("sk-managed"));
}

#[test]
fn test_key_changes_apply_to_next_resolution() {
    let fx = Fixture::new();
    let resolver = fx.resolver(ManagedKeys::new().with("openai", "sk-managed"));

    let before = assert_ok!(resolver.resolve("openai", None));
    assert_eq!(before.mode, CredentialMode::Managed);

    fx.store_key("openai", "sk-added-later");
    let after = assert_ok!(resolver.resolve("openai", None));
    assert_eq!(after.mode, CredentialMode::Byok);
    assert_eq!(after.secret.as_deref(), Some("sk-added-later"));
}

#[test]
fn test_master_key_must_be_32_bytes() {
    assert_err!(SecretStore::from_master_key_b64(""));
    assert_err!(SecretStore::from_master_key_b64("c2hvcnQ="));

    let encoded = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    let store = assert_ok!(SecretStore::from_master_key_b64(encoded));
    let token = assert_ok!(store.encrypt("sk-roundtrip"));
    assert!(!token.contains("sk-roundtrip"));
    assert_eq!(store.decrypt(&token), Ok("sk-roundtrip".to_string()));
}
