//! Untyped manifest objects held by the local reconciler
//!
//! Cluster API objects come in many kinds (Cluster, Machine, AWSCluster,
//! Secret, ...). They are handled as one untyped [`Manifest`] keyed by
//! [`ObjectKey`], with a [`KindRegistry`] mapping each kind name to the API
//! resource it is served under.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_common::kube_utils::{api_resource_with_plural, build_api_resource, parse_api_version};
use strata_common::{Error, Result};

use crate::constants::{
    AWS_API_VERSION, AZURE_API_VERSION, CAPI_CLUSTER_API_VERSION, CORE_API_VERSION,
    GCP_API_VERSION, OPENSTACK_API_VERSION,
};

/// Identity of a stored object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// API version, e.g. `cluster.x-k8s.io/v1beta1`
    pub api_version: String,
    /// Kind, e.g. `Cluster`
    pub kind: String,
    /// Namespace (empty for cluster-scoped objects)
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Cluster API `Cluster`
    pub fn cluster(namespace: &str, name: &str) -> Self {
        Self::new(CAPI_CLUSTER_API_VERSION, "Cluster", namespace, name)
    }

    /// Key of a Cluster API `Machine`
    pub fn machine(namespace: &str, name: &str) -> Self {
        Self::new(CAPI_CLUSTER_API_VERSION, "Machine", namespace, name)
    }

    /// Key of a core `Secret`
    pub fn secret(namespace: &str, name: &str) -> Self {
        Self::new(CORE_API_VERSION, "Secret", namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Object metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    /// Name of the resource
    pub name: String,
    /// Namespace (None for cluster-scoped resources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Server-assigned unique id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Owners of this object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_references: Option<Vec<OwnerReference>>,
    /// Other metadata fields (resourceVersion, generation, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A manifest object of any kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// API version (e.g., "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Kind of resource (e.g., "Cluster", "Machine")
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ManifestMetadata,
    /// Desired state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    /// Observed state, written by controllers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    /// Secret/ConfigMap data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Secret string data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_data: Option<Value>,
    /// Secret type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Any other top-level fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Control-plane endpoint reported on a Cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    /// Hostname or IP
    #[serde(default)]
    pub host: String,
    /// Port
    #[serde(default)]
    pub port: u16,
}

impl ApiEndpoint {
    /// An endpoint is valid once both host and port are set
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl Manifest {
    /// Create an empty manifest
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ManifestMetadata {
                name: name.into(),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: None,
            status: None,
            data: None,
            string_data: None,
            type_: None,
            extra: Map::new(),
        }
    }

    /// Create a Secret with binary data (base64-encoded on the wire)
    pub fn secret(
        name: impl Into<String>,
        namespace: impl Into<String>,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let mut manifest = Self::new(CORE_API_VERSION, "Secret", name, namespace);
        let encoded: Map<String, Value> = data
            .into_iter()
            .map(|(k, v)| (k, Value::String(STANDARD.encode(v))))
            .collect();
        manifest.data = Some(Value::Object(encoded));
        manifest
    }

    /// Set the spec
    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: Value) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the type (for Secrets)
    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Object namespace, empty if cluster-scoped
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Force the namespace
    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.metadata.namespace = Some(namespace.into());
    }

    /// Store key of this object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.api_version.clone(),
            self.kind.clone(),
            self.namespace(),
            self.name(),
        )
    }

    /// Output file name: `{Kind}-{Namespace}-{Name}.yaml`
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.yaml", self.kind, self.namespace(), self.name())
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind(self.kind.clone(), e.to_string()))
    }

    /// Parse from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Value at a `/`-separated JSON pointer under the spec
    pub fn spec_at(&self, pointer: &str) -> Option<&Value> {
        self.spec.as_ref().and_then(|s| s.pointer(pointer))
    }

    /// Value at a `/`-separated JSON pointer under the status
    pub fn status_at(&self, pointer: &str) -> Option<&Value> {
        self.status.as_ref().and_then(|s| s.pointer(pointer))
    }

    /// String at a JSON pointer under the spec, ignoring empty strings
    pub fn spec_str(&self, pointer: &str) -> Option<&str> {
        self.spec_at(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// String at a JSON pointer under the status, ignoring empty strings
    pub fn status_str(&self, pointer: &str) -> Option<&str> {
        self.status_at(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `spec.controlPlaneEndpoint`, default if unset
    pub fn control_plane_endpoint(&self) -> ApiEndpoint {
        self.spec_at("/controlPlaneEndpoint")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether `status.infrastructureReady` is true
    pub fn infrastructure_ready(&self) -> bool {
        self.status_at("/infrastructureReady")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Decoded binary value of a Secret data key
    pub fn secret_data(&self, key: &str) -> Result<Vec<u8>> {
        let encoded = self
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::not_found(
                    format!("{} data key", self.kind),
                    format!("{}/{}", self.key(), key),
                )
            })?;
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::serialization_for_kind(self.kind.clone(), e.to_string()))
    }

    /// Replace one Secret data key with binary data
    pub fn set_secret_data(&mut self, key: &str, value: &[u8]) {
        if !matches!(self.data, Some(Value::Object(_))) {
            self.data = Some(Value::Object(Map::new()));
        }
        if let Some(Value::Object(map)) = self.data.as_mut() {
            map.insert(key.to_string(), Value::String(STANDARD.encode(value)));
        }
    }
}

/// Where a kind is served
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// API version the kind is registered under
    pub api_version: String,
    /// Lowercase plural resource name
    pub plural: String,
}

/// Registry of known kinds
///
/// The reconciler is reached without API discovery, so every kind the
/// orchestrator or a provider touches is registered up front. Unknown kinds
/// fall back to naive pluralization.
#[derive(Clone, Debug)]
pub struct KindRegistry {
    kinds: HashMap<String, KindInfo>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register("Cluster", CAPI_CLUSTER_API_VERSION, "clusters");
        registry.register("Machine", CAPI_CLUSTER_API_VERSION, "machines");
        registry.register("Secret", CORE_API_VERSION, "secrets");
        registry.register("ConfigMap", CORE_API_VERSION, "configmaps");
        registry.register("AWSCluster", AWS_API_VERSION, "awsclusters");
        registry.register("AWSMachine", AWS_API_VERSION, "awsmachines");
        registry.register("AzureCluster", AZURE_API_VERSION, "azureclusters");
        registry.register("AzureMachine", AZURE_API_VERSION, "azuremachines");
        registry.register("GCPCluster", GCP_API_VERSION, "gcpclusters");
        registry.register("GCPMachine", GCP_API_VERSION, "gcpmachines");
        registry.register("OpenStackCluster", OPENSTACK_API_VERSION, "openstackclusters");
        registry.register("OpenStackMachine", OPENSTACK_API_VERSION, "openstackmachines");
        registry
    }
}

impl KindRegistry {
    /// Register (or override) a kind
    pub fn register(&mut self, kind: &str, api_version: &str, plural: &str) {
        self.kinds.insert(
            kind.to_string(),
            KindInfo {
                api_version: api_version.to_string(),
                plural: plural.to_string(),
            },
        );
    }

    /// Look up a kind
    pub fn get(&self, kind: &str) -> Option<&KindInfo> {
        self.kinds.get(kind)
    }

    /// Check if a kind is registered
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// ApiResource for an object key
    ///
    /// The key's own apiVersion wins; the registry only supplies the plural
    /// when the group matches the registered one.
    pub fn api_resource(&self, key: &ObjectKey) -> ApiResource {
        match self.kinds.get(&key.kind) {
            Some(info)
                if parse_api_version(&info.api_version).0
                    == parse_api_version(&key.api_version).0 =>
            {
                api_resource_with_plural(&key.api_version, &key.kind, &info.plural)
            }
            _ => build_api_resource(&key.api_version, &key.kind),
        }
    }
}
