//! C4 — Resilient cache (spec §4.4).
//!
//! Fronts only the two expensive, rarely-changing listing calls (accounts,
//! permission sets). Read protocol: issue the cache read and the API read
//! concurrently, then resolve per spec §4.4's five-way truth table. There is
//! no TTL — freshness comes entirely from the API-first comparison, and
//! equality is always compared on parsed structures, never serialized
//! bytes (spec §9).

use serde::{de::DeserializeOwned, Serialize};

use crate::directory::{Account, Directory, DirectoryError, PermissionSet};
use crate::objectstore::ObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

const ACCOUNTS_KEY: &str = "accounts.json";

fn permission_set_key(arn: &str) -> String {
    format!("permission_sets/{}.json", arn.replace([':', '/'], "_"))
}

/// Generic read-through-and-reconcile used for both cached collections;
/// spec §4.4's five-way protocol lives here once instead of being
/// duplicated for accounts and permission sets.
async fn read_through<T, ApiFut>(
    store: &dyn ObjectStore,
    cache_key: &str,
    api_read: ApiFut,
    cache_enabled: bool,
) -> Result<T, DirectoryError>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq,
    ApiFut: std::future::Future<Output = Result<T, DirectoryError>>,
{
    if !cache_enabled {
        return api_read.await;
    }

    let cache_read = async {
        match store.get(cache_key).await {
            Ok(Some(bytes)) => serde_json::from_slice::<T>(&bytes).ok(),
            _ => None,
        }
    };

    let (api_result, cached) = tokio::join!(api_read, cache_read);

    match (api_result, cached) {
        (Ok(api_value), Some(cached_value)) if api_value == cached_value => Ok(api_value),
        (Ok(api_value), Some(_)) => {
            write_through(store, cache_key, &api_value).await;
            Ok(api_value)
        }
        (Ok(api_value), None) => {
            write_through(store, cache_key, &api_value).await;
            Ok(api_value)
        }
        (Err(api_err), Some(cached_value)) => {
            tracing::warn!(error = %api_err, cache_key, "API read failed, serving cached value");
            Ok(cached_value)
        }
        (Err(api_err), None) => Err(api_err),
    }
}

/// Cache writes never cause a caller-visible failure (spec §4.4 invariant):
/// errors are logged, not propagated.
async fn write_through<T: Serialize>(store: &dyn ObjectStore, key: &str, value: &T) {
    let Ok(bytes) = serde_json::to_vec(value) else {
        tracing::warn!(key, "failed to serialize value for cache write-through");
        return;
    };
    if let Err(e) = store.put(key, bytes).await {
        tracing::warn!(error = %e, key, "cache write-through failed, continuing with API value");
    }
}

pub struct ResilientCache<'a> {
    store: &'a dyn ObjectStore,
    directory: &'a dyn Directory,
    cache_enabled: bool,
}

impl<'a> ResilientCache<'a> {
    pub fn new(store: &'a dyn ObjectStore, directory: &'a dyn Directory, cache_enabled: bool) -> Self {
        Self { store, directory, cache_enabled }
    }

    pub async fn get_accounts(&self) -> Result<Vec<Account>, CacheError> {
        let accounts = read_through(
            self.store,
            ACCOUNTS_KEY,
            async { self.directory.list_accounts().await },
            self.cache_enabled,
        )
        .await?;
        Ok(accounts)
    }

    pub async fn get_permission_set(&self, arn: &str) -> Result<PermissionSet, CacheError> {
        let key = permission_set_key(arn);
        let ps = read_through(
            self.store,
            &key,
            async { self.directory.describe_permission_set(arn).await },
            self.cache_enabled,
        )
        .await?;
        Ok(ps)
    }
}
