//! Provisioning runs against the in-memory reconciler
//!
//! A spawned task plays the Cluster API controllers, publishing the
//! control-plane endpoint and machine readiness through
//! `MemoryStore::mutate` while the orchestrator polls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use strata_capi::constants::{CAPI_CLUSTER_API_VERSION, SECRET_VALUE_KEY};
use strata_capi::{
    IgnitionInput, IgnitionProvider, InfraProvider, InfraReadyInput, InfraReadyProvider,
    Manifest, ManifestStore, MemoryStore, MemorySystem, ObjectKey, PostProvider,
    PostProvisionInput, PreProvider, PreProvisionInput, ProvisionAssets, Provider,
    ReconcilerSystem, SystemState,
};
use strata_common::retry::Backoff;
use strata_common::{ClusterId, Error, InstallConfig, Result, CAPI_NAMESPACE};
use strata_ignition::{CertKeyPair, CertReissuer, IgnitionOutput, InstallInfo, PkiError};

const INFRA_ID: &str = "demo-x7k2p";
const BOOTSTRAP_IGNITION: &[u8] = br#"{"ignition":{"version":"3.2.0"}}"#;
const MASTER_IGNITION: &[u8] = br#"{"ignition":{"version":"3.2.0","config":{}}}"#;

struct NoCerts;

impl CertReissuer for NoCerts {
    fn reissue_mcs(
        &self,
        _: &str,
        _: &[std::net::IpAddr],
    ) -> std::result::Result<CertKeyPair, PkiError> {
        Err(PkiError::Generation("unexpected certificate reissue".into()))
    }
}

/// Provider that records which hooks ran, in order
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_pre: bool,
}

impl Recorder {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PreProvider for Recorder {
    async fn pre_provision(&self, input: &PreProvisionInput<'_>) -> Result<()> {
        self.calls.lock().push("pre");
        assert_eq!(input.worker_machine_sets, 1);
        if self.fail_pre {
            return Err(Error::provider_permanent("test", "quota exceeded"));
        }
        Ok(())
    }
}

#[async_trait]
impl InfraReadyProvider for Recorder {
    async fn infra_ready(&self, input: &InfraReadyInput<'_>) -> Result<()> {
        self.calls.lock().push("infra-ready");
        assert!(input.cluster.control_plane_endpoint().is_valid());
        Ok(())
    }
}

#[async_trait]
impl IgnitionProvider for Recorder {
    async fn ignition(&self, input: &IgnitionInput<'_>) -> Result<IgnitionOutput> {
        self.calls.lock().push("ignition");
        assert_ne!(input.bootstrap_ignition, BOOTSTRAP_IGNITION);
        Ok(IgnitionOutput {
            bootstrap: b"edited-bootstrap".to_vec(),
            master: b"edited-master".to_vec(),
        })
    }
}

#[async_trait]
impl PostProvider for Recorder {
    async fn post_provision(&self, input: &PostProvisionInput<'_>) -> Result<()> {
        self.calls.lock().push("post");
        let machines = input
            .client
            .list(CAPI_CLUSTER_API_VERSION, "Machine", CAPI_NAMESPACE)
            .await?;
        assert!(machines.iter().all(Manifest::infrastructure_ready));
        Ok(())
    }
}

impl Provider for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn as_pre_provider(&self) -> Option<&dyn PreProvider> {
        Some(self)
    }

    fn as_infra_ready_provider(&self) -> Option<&dyn InfraReadyProvider> {
        Some(self)
    }

    fn as_ignition_provider(&self) -> Option<&dyn IgnitionProvider> {
        Some(self)
    }

    fn as_post_provider(&self) -> Option<&dyn PostProvider> {
        Some(self)
    }
}

fn install_config() -> InstallConfig {
    InstallConfig::from_yaml(
        "metadata: {name: demo}\n\
         baseDomain: example.com\n\
         networking: {machineNetwork: [{cidr: 10.0.0.0/16}]}\n\
         controlPlane: {replicas: 3}\n\
         compute: [{name: worker, replicas: 3}]\n\
         platform:\n  ibmcloud:\n    region: us-south\n",
    )
    .unwrap()
}

fn assets() -> ProvisionAssets {
    ProvisionAssets {
        cluster_id: ClusterId::new(INFRA_ID, "demo"),
        install_config: install_config(),
        manifests: vec![
            // applied into the guest namespace whatever they declare
            Manifest::new(CAPI_CLUSTER_API_VERSION, "Cluster", INFRA_ID, "default"),
            Manifest::new(CAPI_CLUSTER_API_VERSION, "Machine", "demo-x7k2p-master-0", "default"),
        ],
        bootstrap_ignition: BOOTSTRAP_IGNITION.to_vec(),
        master_ignition: MASTER_IGNITION.to_vec(),
        admin_kubeconfig: b"apiVersion: v1\nkind: Config\n".to_vec(),
        masters_schedulable: false,
        worker_machine_sets: 1,
        install_info: InstallInfo::default(),
    }
}

fn fast_wait(steps: u32) -> Backoff {
    Backoff {
        initial: Duration::from_millis(10),
        factor: 1.0,
        steps,
        cap: Duration::from_millis(10),
    }
}

/// Publish the endpoint and machine readiness after `polls` misses
fn spawn_controller(store: Arc<MemoryStore>, polls: u32) {
    tokio::spawn(async move {
        let cluster = ObjectKey::cluster(CAPI_NAMESPACE, INFRA_ID);
        let machine = ObjectKey::machine(CAPI_NAMESPACE, "demo-x7k2p-master-0");
        while store.get(&cluster).await.is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(10 * u64::from(polls))).await;
        store.mutate(&cluster, |c| {
            c.spec = Some(json!({
                "controlPlaneEndpoint": {"host": "api.demo.example.com", "port": 6443}
            }));
        });
        store.mutate(&machine, |m| {
            m.status = Some(json!({"infrastructureReady": true}));
        });
    });
}

#[tokio::test]
async fn provision_runs_hooks_in_order_and_emits_manifests() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemorySystem::new(store.clone()));
    let recorder = Recorder::default();
    let infra = InfraProvider::new(
        Box::new(recorder.clone()),
        system.clone(),
        Arc::new(NoCerts),
        "/tmp/assets",
    )
    .with_wait(fast_wait(100));

    spawn_controller(store.clone(), 3);
    let cancel = CancellationToken::new();
    let files = infra.provision(&assets(), cancel.clone()).await.unwrap();

    assert_eq!(recorder.calls(), vec!["pre", "infra-ready", "ignition", "post"]);

    let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Cluster-openshift-cluster-api-guests-demo-x7k2p.yaml",
            "Machine-openshift-cluster-api-guests-demo-x7k2p-master-0.yaml",
            "Secret-openshift-cluster-api-guests-demo-x7k2p-master.yaml",
            "Secret-openshift-cluster-api-guests-demo-x7k2p-bootstrap.yaml",
            "Secret-openshift-cluster-api-guests-demo-x7k2p-kubeconfig.yaml",
        ]
    );

    // emitted files reflect the edited ignition, not the submitted one
    let bootstrap = files
        .iter()
        .find(|f| f.filename.ends_with("demo-x7k2p-bootstrap.yaml"))
        .unwrap();
    let secret = Manifest::from_yaml(std::str::from_utf8(&bootstrap.data).unwrap()).unwrap();
    assert_eq!(secret.secret_data(SECRET_VALUE_KEY).unwrap(), b"edited-bootstrap");

    let kubeconfig = store
        .get(&ObjectKey::secret(CAPI_NAMESPACE, "demo-x7k2p-kubeconfig"))
        .await
        .unwrap();
    let owner = &kubeconfig.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.kind, "Cluster");
    assert_eq!(owner.name, INFRA_ID);

    cancel.cancel();
}

#[tokio::test]
async fn endpoint_timeout_skips_later_hooks() {
    let system = Arc::new(MemorySystem::default());
    let recorder = Recorder::default();
    let infra = InfraProvider::new(
        Box::new(recorder.clone()),
        system.clone(),
        Arc::new(NoCerts),
        "/tmp/assets",
    )
    .with_wait(fast_wait(3));

    let err = infra
        .provision(&assets(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err.root(), Error::Timeout { .. }));
    assert!(err
        .to_string()
        .starts_with("failed to wait for control plane endpoint"));
    assert_eq!(recorder.calls(), vec!["pre"]);
}

#[tokio::test]
async fn pre_provision_failure_applies_nothing() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemorySystem::new(store.clone()));
    let recorder = Recorder {
        fail_pre: true,
        ..Default::default()
    };
    let infra = InfraProvider::new(
        Box::new(recorder.clone()),
        system.clone(),
        Arc::new(NoCerts),
        "/tmp/assets",
    );

    let err = infra
        .provision(&assets(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("failed during pre-provisioning"));
    assert!(store.is_empty());
    assert_eq!(system.state(), SystemState::Stopped);
}

#[tokio::test]
async fn cancellation_stops_waiting_and_tears_down() {
    let system = Arc::new(MemorySystem::default());
    let infra = InfraProvider::new(
        Box::new(Recorder::default()),
        system.clone(),
        Arc::new(NoCerts),
        "/tmp/assets",
    )
    .with_wait(fast_wait(1000));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = infra.provision(&assets(), cancel).await.unwrap_err();
    assert!(err.to_string().contains("provisioning cancelled"));

    for _ in 0..100 {
        if system.state() == SystemState::Stopped {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("reconciler was not torn down after cancellation");
}

#[tokio::test]
async fn destroy_bootstrap_after_provision_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemorySystem::new(store.clone()));
    system.run(&install_config()).await.unwrap();
    store
        .create(&Manifest::new(
            CAPI_CLUSTER_API_VERSION,
            "Machine",
            "demo-x7k2p-bootstrap",
            CAPI_NAMESPACE,
        ))
        .await
        .unwrap();

    let infra = InfraProvider::new(
        Box::new(Recorder::default()),
        system.clone(),
        Arc::new(NoCerts),
        "/tmp/assets",
    );
    let id = ClusterId::new(INFRA_ID, "demo");
    infra.destroy_bootstrap(&id).await.unwrap();
    infra.destroy_bootstrap(&id).await.unwrap();
    assert!(store
        .get(&ObjectKey::machine(CAPI_NAMESPACE, "demo-x7k2p-bootstrap"))
        .await
        .unwrap_err()
        .is_not_found());

    system.teardown().await;
    infra.destroy_bootstrap(&id).await.unwrap();
}
