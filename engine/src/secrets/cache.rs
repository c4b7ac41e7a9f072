use crate::secrets::{SecretManager, SecretString};
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory cache in front of `SecretManager`, so providers do not hit the
/// keychain on every request.
#[derive(Clone)]
pub struct SecretCache {
    manager: Arc<SecretManager>,
    cache: Arc<RwLock<HashMap<String, SecretString>>>,
}

impl SecretCache {
    pub fn new(manager: Arc<SecretManager>) -> Self {
        Self {
            manager,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cached lookup; misses go to the manager and are remembered
    pub fn get_secret(&self, key: &str) -> Result<SecretString, EngineError> {
        {
            let cache = self
                .cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(secret) = cache.get(key) {
                return Ok(secret.clone());
            }
        }

        let secret = self.manager.get_secret(key)?;

        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), secret.clone());

        Ok(secret)
    }

    /// Seed the cache, bypassing the manager
    pub fn insert(&self, key: &str, value: SecretString) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }

    pub fn manager(&self) -> &SecretManager {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_secret_is_served_from_cache() {
        let cache = SecretCache::new(Arc::new(SecretManager::new("steward-test")));
        cache.insert("openai_api_key", SecretString::new("sk-cached"));

        assert_eq!(cache.get_secret("openai_api_key").unwrap().unsecure(), "sk-cached");
    }
}
