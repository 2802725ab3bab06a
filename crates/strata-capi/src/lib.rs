//! Cluster API provisioning orchestrator
//!
//! This crate provides:
//! - InfraProvider, the state machine that drives a provisioning run
//! - Provider hook traits and the AWS, Azure, GCP and OpenStack providers
//! - ReconcilerSystem, the handle to the local Cluster API runtime
//! - ManifestStore for reading and writing Cluster API objects

pub mod client;
pub mod constants;
pub mod infra;
pub mod manifest;
pub mod provider;
pub mod system;

// Re-export client types
pub use client::{KubeManifestStore, ManifestStore, MemoryStore};

// Re-export orchestrator types
pub use infra::{load_manifests, InfraProvider, OutputFile, ProvisionAssets};

// Re-export manifest types
pub use manifest::{ApiEndpoint, KindRegistry, Manifest, ManifestMetadata, ObjectKey};

// Re-export provider types
pub use provider::{
    create_provider, CloudClients, DefaultProvider, IgnitionInput, IgnitionProvider,
    InfraReadyInput, InfraReadyProvider, PostProvider, PostProvisionInput, PreProvider,
    PreProvisionInput, Provider, ProviderState,
};

// Re-export system types
pub use system::{KubeSystem, MemorySystem, ReconcilerSystem, SystemState};
