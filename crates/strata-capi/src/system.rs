//! Handle to the local reconciliation runtime
//!
//! The runtime runs the Cluster API controllers that turn manifests into
//! cloud resources. It is constructed once per install run, started, handed
//! to the orchestrator and torn down on completion or cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use strata_common::kube_utils::create_client;
use strata_common::{Error, InstallConfig, Result};

use crate::client::{KubeManifestStore, ManifestStore, MemoryStore};

/// Lifecycle state of the reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemState {
    /// Not started, or fully torn down
    Stopped,
    /// Accepting requests
    Running,
    /// Shutting down
    Tearing,
    /// Failed to start
    Failed,
}

/// The local reconciler as seen by the orchestrator
#[async_trait]
pub trait ReconcilerSystem: Send + Sync {
    /// Start the reconciler for an install
    async fn run(&self, install_config: &InstallConfig) -> Result<()>;

    /// Object-store client; only available while running
    fn client(&self) -> Result<Arc<dyn ManifestStore>>;

    /// Stop the reconciler; safe to call more than once
    async fn teardown(&self);

    /// Current lifecycle state
    fn state(&self) -> SystemState;
}

fn not_running() -> Error {
    Error::internal_with_context("reconciler", "reconciler system is not running")
}

/// Reconciler reached through a kubeconfig for an already-started API server
pub struct KubeSystem {
    kubeconfig: PathBuf,
    state: RwLock<SystemState>,
    store: RwLock<Option<Arc<KubeManifestStore>>>,
}

impl KubeSystem {
    /// Create a handle for the API server described by `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            state: RwLock::new(SystemState::Stopped),
            store: RwLock::new(None),
        }
    }
}

#[async_trait]
impl ReconcilerSystem for KubeSystem {
    async fn run(&self, install_config: &InstallConfig) -> Result<()> {
        let client = match create_client(&self.kubeconfig).await {
            Ok(client) => client,
            Err(e) => {
                *self.state.write() = SystemState::Failed;
                return Err(e.context("failed to start reconciler"));
            }
        };
        if let Err(e) = client.apiserver_version().await {
            *self.state.write() = SystemState::Failed;
            return Err(Error::from(e).context("failed to reach reconciler API server"));
        }

        *self.store.write() = Some(Arc::new(KubeManifestStore::new(client)));
        *self.state.write() = SystemState::Running;
        info!(
            cluster = %install_config.metadata.name,
            kubeconfig = %self.kubeconfig.display(),
            "Reconciler system running"
        );
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn ManifestStore>> {
        match self.store.read().as_ref() {
            Some(store) if *self.state.read() == SystemState::Running => {
                Ok(store.clone() as Arc<dyn ManifestStore>)
            }
            _ => Err(not_running()),
        }
    }

    async fn teardown(&self) {
        {
            let mut state = self.state.write();
            if *state != SystemState::Running {
                return;
            }
            *state = SystemState::Tearing;
        }
        self.store.write().take();
        *self.state.write() = SystemState::Stopped;
        warn!("Reconciler system torn down");
    }

    fn state(&self) -> SystemState {
        *self.state.read()
    }
}

/// In-process reconciler over a [`MemoryStore`]
///
/// No controllers run; tests drive status changes through
/// [`MemoryStore::mutate`] on [`MemorySystem::store`].
pub struct MemorySystem {
    store: Arc<MemoryStore>,
    state: RwLock<SystemState>,
}

impl Default for MemorySystem {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

impl MemorySystem {
    /// Create a system over an existing store
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            state: RwLock::new(SystemState::Stopped),
        }
    }

    /// The underlying store
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }
}

#[async_trait]
impl ReconcilerSystem for MemorySystem {
    async fn run(&self, install_config: &InstallConfig) -> Result<()> {
        *self.state.write() = SystemState::Running;
        info!(cluster = %install_config.metadata.name, "In-memory reconciler running");
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn ManifestStore>> {
        if *self.state.read() == SystemState::Running {
            Ok(self.store.clone() as Arc<dyn ManifestStore>)
        } else {
            Err(not_running())
        }
    }

    async fn teardown(&self) {
        let mut state = self.state.write();
        if *state == SystemState::Running {
            *state = SystemState::Stopped;
            info!("In-memory reconciler stopped");
        }
    }

    fn state(&self) -> SystemState {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_system_lifecycle() {
        let system = MemorySystem::default();
        assert_eq!(system.state(), SystemState::Stopped);
        assert!(system.client().is_err());

        system.run(&InstallConfig::default()).await.unwrap();
        assert_eq!(system.state(), SystemState::Running);
        assert!(system.client().is_ok());

        system.teardown().await;
        system.teardown().await;
        assert_eq!(system.state(), SystemState::Stopped);
        assert!(system.client().is_err());
    }

    #[tokio::test]
    async fn kube_system_fails_on_missing_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let system = KubeSystem::new(dir.path().join("missing"));

        let err = system.run(&InstallConfig::default()).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to start reconciler"));
        assert_eq!(system.state(), SystemState::Failed);
        assert!(system.client().is_err());

        system.teardown().await;
        assert_eq!(system.state(), SystemState::Failed);
    }
}
