//! Secret references.
//!
//! Configuration values naming secrets use the form `PROVIDER#KEY`.
//! Built-in providers: `CLEAR` (the key is the literal value) and `ENV`
//! (the key names a process environment variable). Providers are
//! pluggable by id.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use lakerun_types::error::{OrchestrationError, Result};

static SECRET_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z][A-Z0-9_]*)#(.+)$").expect("valid secret ref regex"));

/// Resolves a secret key to its value.
pub trait SecretProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns a configuration error if the key cannot be resolved.
    fn resolve(&self, key: &str) -> Result<String>;
}

struct ClearTextProvider;

impl SecretProvider for ClearTextProvider {
    fn resolve(&self, key: &str) -> Result<String> {
        Ok(key.to_string())
    }
}

struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn resolve(&self, key: &str) -> Result<String> {
        std::env::var(key).map_err(|_| {
            OrchestrationError::Config(format!("environment secret '{key}' is not set"))
        })
    }
}

/// Registry of secret providers keyed by id.
pub struct SecretProviderRegistry {
    providers: BTreeMap<String, Box<dyn SecretProvider>>,
}

impl SecretProviderRegistry {
    /// Registry with `CLEAR` and `ENV` registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            providers: BTreeMap::new(),
        };
        registry.register("CLEAR", Box::new(ClearTextProvider));
        registry.register("ENV", Box::new(EnvSecretProvider));
        registry
    }

    /// Register or replace a provider.
    pub fn register(&mut self, id: impl Into<String>, provider: Box<dyn SecretProvider>) {
        self.providers.insert(id.into(), provider);
    }

    /// Resolve a configuration value: values of the form `PROVIDER#KEY`
    /// with a registered provider go through it, everything else passes
    /// through unchanged.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the named provider fails to
    /// resolve the key.
    pub fn resolve_value(&self, value: &str) -> Result<String> {
        let Some(captures) = SECRET_REF_RE.captures(value) else {
            return Ok(value.to_string());
        };
        let provider_id = &captures[1];
        let key = &captures[2];
        match self.providers.get(provider_id) {
            Some(provider) => provider.resolve(key),
            // Not a registered provider: treat as a literal value (paths
            // like "A#b" stay usable).
            None => Ok(value.to_string()),
        }
    }
}

impl Default for SecretProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
