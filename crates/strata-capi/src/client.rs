//! Object-store client for the local reconciler
//!
//! Provides a trait-based abstraction over create/get/update/delete of
//! manifest objects, allowing tests and the in-memory system to stand in for
//! a real API server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::Client;
use parking_lot::RwLock;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use strata_common::{Error, Result};

use crate::manifest::{KindRegistry, Manifest, ObjectKey};

/// Generic object store keyed by apiVersion, kind, namespace and name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Create an object; fails with already-exists if the key is taken
    async fn create(&self, manifest: &Manifest) -> Result<Manifest>;

    /// Fetch an object; fails with not-found if absent
    async fn get(&self, key: &ObjectKey) -> Result<Manifest>;

    /// Replace an existing object
    async fn update(&self, manifest: &Manifest) -> Result<Manifest>;

    /// Delete an object; fails with not-found if absent
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// List objects of one kind in a namespace
    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Manifest>>;
}

/// Map a kube 404 to our not-found error, leaving other errors as-is
fn map_kube_error(key: &ObjectKey, e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(&key.kind, key.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => Error::already_exists(&key.kind, key.to_string()),
        _ => Error::from(e),
    }
}

fn to_dynamic(manifest: &Manifest) -> Result<DynamicObject> {
    let value = serde_json::to_value(manifest)
        .map_err(|e| Error::serialization_for_kind(manifest.kind.clone(), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(manifest.kind.clone(), e.to_string()))
}

fn from_dynamic(obj: DynamicObject) -> Result<Manifest> {
    let value = serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
}

/// Store backed by a Kubernetes API server, using DynamicObject for all kinds
pub struct KubeManifestStore {
    client: Client,
    registry: KindRegistry,
}

impl KubeManifestStore {
    /// Create a store with the default kind registry
    pub fn new(client: Client) -> Self {
        Self::with_registry(client, KindRegistry::default())
    }

    /// Create a store with a custom kind registry
    pub fn with_registry(client: Client, registry: KindRegistry) -> Self {
        Self { client, registry }
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        let ar = self.registry.api_resource(key);
        if key.namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), &key.namespace, &ar)
        }
    }
}

#[async_trait]
impl ManifestStore for KubeManifestStore {
    async fn create(&self, manifest: &Manifest) -> Result<Manifest> {
        let key = manifest.key();
        let obj = to_dynamic(manifest)?;
        let created = self
            .api(&key)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_error(&key, e))?;
        info!(kind = %key.kind, name = %key.name, namespace = %key.namespace, "Created manifest");
        from_dynamic(created)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Manifest> {
        let obj = self
            .api(key)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_error(key, e))?;
        from_dynamic(obj)
    }

    async fn update(&self, manifest: &Manifest) -> Result<Manifest> {
        let key = manifest.key();
        let api = self.api(&key);
        let current = api.get(&key.name).await.map_err(|e| map_kube_error(&key, e))?;

        let mut obj = to_dynamic(manifest)?;
        obj.metadata.resource_version = current.metadata.resource_version;
        let updated = api
            .replace(&key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_error(&key, e))?;
        debug!(kind = %key.kind, name = %key.name, "Updated manifest");
        from_dynamic(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api(key)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(key, e))?;
        info!(kind = %key.kind, name = %key.name, "Deleted manifest");
        Ok(())
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Manifest>> {
        let key = ObjectKey::new(api_version, kind, namespace, "");
        let list = self
            .api(&key)
            .list(&ListParams::default())
            .await
            .map_err(Error::from)?;
        list.items.into_iter().map(from_dynamic).collect()
    }
}

/// In-process store used by the in-memory reconciler and tests
///
/// Assigns a uid and resourceVersion on create, like an API server would.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, Manifest>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Apply a mutation to a stored object, as a controller would
    ///
    /// Returns false if the object does not exist.
    pub fn mutate<F>(&self, key: &ObjectKey, f: F) -> bool
    where
        F: FnOnce(&mut Manifest),
    {
        match self.objects.write().get_mut(key) {
            Some(obj) => {
                f(obj);
                true
            }
            None => false,
        }
    }

    fn next_version(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn create(&self, manifest: &Manifest) -> Result<Manifest> {
        let key = manifest.key();
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::already_exists(&key.kind, key.to_string()));
        }

        let version = self.next_version();
        let mut stored = manifest.clone();
        stored
            .metadata
            .uid
            .get_or_insert_with(|| format!("uid-{}", version));
        stored
            .metadata
            .extra
            .insert("resourceVersion".to_string(), version.to_string().into());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Manifest> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(&key.kind, key.to_string()))
    }

    async fn update(&self, manifest: &Manifest) -> Result<Manifest> {
        let key = manifest.key();
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::not_found(&key.kind, key.to_string()))?;

        let mut stored = manifest.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.extra.insert(
            "resourceVersion".to_string(),
            self.next_version().to_string().into(),
        );
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(&key.kind, key.to_string()))
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Manifest>> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|(k, _)| k.api_version == api_version && k.kind == kind && k.namespace == namespace)
            .map(|(_, m)| m.clone())
            .collect())
    }
}
