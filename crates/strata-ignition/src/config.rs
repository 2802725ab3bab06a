//! Ignition document model
//!
//! Only the parts of the Ignition v3 schema we read or rewrite are typed.
//! Everything else is carried through `extra` maps so a parse/serialize
//! cycle leaves unknown sections and unrelated files intact.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_common::{Error, Result};

use crate::dataurl;

/// Default mode for files we add (0644)
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// A whole Ignition config
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnitionConfig {
    /// The `ignition` section (version, config merges)
    #[serde(default)]
    pub ignition: IgnitionSection,
    /// The `storage` section
    #[serde(default, skip_serializing_if = "Storage::is_empty")]
    pub storage: Storage,
    /// Other top-level sections (systemd, passwd, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `ignition` section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnitionSection {
    /// Spec version, e.g. `3.2.0`
    #[serde(default)]
    pub version: String,
    /// Remote configs to merge or replace with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigReferences>,
    /// Other fields (security, timeouts, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Pointer configs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigReferences {
    /// Configs merged into this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge: Vec<Resource>,
    /// Config replacing this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<Resource>,
    /// Other fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A remote or inline resource
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// URL of the resource (http(s), s3, data, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Other fields (compression, verification, headers)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `storage` section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    /// Files written on first boot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
    /// Other storage fields (directories, links, disks)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Storage {
    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.extra.is_empty()
    }
}

/// One file entry in `storage.files`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    /// Absolute path on the target machine
    pub path: String,
    /// File contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Resource>,
    /// Other fields (mode, overwrite, user, group, append)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl File {
    /// A root-owned file with inline contents, overwriting any existing file
    pub fn inline(path: impl Into<String>, data: &[u8], mode: u32) -> Self {
        let mut extra = Map::new();
        extra.insert("mode".to_string(), Value::from(mode));
        extra.insert("overwrite".to_string(), Value::Bool(true));
        extra.insert("user".to_string(), serde_json::json!({ "name": "root" }));
        Self {
            path: path.into(),
            contents: Some(Resource {
                source: Some(dataurl::encode(data)),
                extra: Map::new(),
            }),
            extra,
        }
    }

    /// Decode the inline contents of this file
    pub fn decoded_contents(&self) -> Result<Vec<u8>> {
        let source = self
            .contents
            .as_ref()
            .and_then(|c| c.source.as_deref())
            .ok_or_else(|| Error::ignition(&self.path, "file has no contents source"))?;
        dataurl::decode(source).map_err(|e| match e {
            Error::Ignition { message, .. } => Error::ignition(&self.path, message),
            other => other,
        })
    }

    /// Replace the inline contents of this file, leaving every other field alone
    pub fn set_contents(&mut self, data: &[u8]) {
        let contents = self.contents.get_or_insert_with(Resource::default);
        contents.source = Some(dataurl::encode(data));
    }
}

impl IgnitionConfig {
    /// Parse a config from JSON bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::ignition("config", format!("failed to parse ignition: {}", e)))
    }

    /// Serialize the config to JSON bytes
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::ignition("config", format!("failed to marshal ignition: {}", e)))
    }

    /// Look up a file by path
    pub fn file(&self, path: &str) -> Option<&File> {
        self.storage.files.iter().find(|f| f.path == path)
    }

    /// Look up a file by path for in-place editing
    pub fn file_mut(&mut self, path: &str) -> Option<&mut File> {
        self.storage.files.iter_mut().find(|f| f.path == path)
    }

    /// Replace the file with the same path, or append it
    pub fn upsert_file(&mut self, file: File) {
        match self.file_mut(&file.path) {
            Some(existing) => *existing = file,
            None => self.storage.files.push(file),
        }
    }
}
