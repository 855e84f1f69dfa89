// Copyright the Cluster Gateway Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Access to cluster credential records.
//!
//! A record is an opaque key-value blob with labels, annotations and a data
//! map, owned by the hosting control plane. The gateway only ever reads
//! records; mutation happens through the host's controllers. Two sources are
//! provided: an in-memory store fed by the host framework's cache, and a
//! directory of YAML manifests for running the gateway stand-alone.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

/// One cluster credential record, keyed by cluster name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretRecord {
    pub fn named(name: impl Into<String>) -> Self {
        SecretRecord {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error reading records: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record manifest {name}: {reason}")]
    Manifest { name: String, reason: String },
}

/// Read-only view of the cluster credential records.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<SecretRecord>, Error>;

    /// All records carrying the given label key. Used by the list operation
    /// of the access store.
    async fn list(&self, label: &str) -> Result<Vec<SecretRecord>, Error>;
}

/// Optional registry of cluster metadata maintained next to the records;
/// when present, its endpoint and CA take precedence over the record's data
/// keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub endpoint: String,
    pub ca_bundle: Option<Vec<u8>>,
}

#[async_trait::async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<RegistryEntry>, Error>;
}

/// In-memory store, fed by the host framework's shared cache (or by tests).
#[derive(Default)]
pub struct MemorySecretStore {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemorySecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, record: SecretRecord) {
        self.records
            .write()
            .await
            .insert(record.name.clone(), record);
    }

    pub async fn remove(&self, name: &str) {
        self.records.write().await.remove(name);
    }
}

#[async_trait::async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretRecord>, Error> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn list(&self, label: &str) -> Result<Vec<SecretRecord>, Error> {
        let records = self.records.read().await;
        let mut out: Vec<SecretRecord> = records
            .values()
            .filter(|r| r.labels.contains_key(label))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryClusterRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl MemoryClusterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, name: impl Into<String>, entry: RegistryEntry) {
        self.entries.write().await.insert(name.into(), entry);
    }
}

#[async_trait::async_trait]
impl ClusterRegistry for MemoryClusterRegistry {
    async fn get(&self, name: &str) -> Result<Option<RegistryEntry>, Error> {
        Ok(self.entries.read().await.get(name).cloned())
    }
}

/// Secret-shaped manifest layout accepted by [`DirSecretStore`].
/// `data` values are base64, `stringData` values are plain text;
/// `stringData` wins on key collision, matching the convention of the
/// records this store mirrors.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    metadata: ManifestMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
    #[serde(default)]
    string_data: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct ManifestMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// Directory-backed store: one `<cluster>.yaml` manifest per cluster.
/// Files are re-read on every lookup so record rotation needs no restart.
pub struct DirSecretStore {
    dir: PathBuf,
}

impl DirSecretStore {
    pub fn new(dir: PathBuf) -> Arc<Self> {
        Arc::new(DirSecretStore { dir })
    }

    fn parse(name: &str, raw: &str) -> Result<SecretRecord, Error> {
        let manifest: Manifest = serde_yaml::from_str(raw).map_err(|e| Error::Manifest {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let mut data = BTreeMap::new();
        for (k, v) in manifest.data {
            let decoded = BASE64.decode(v.as_bytes()).map_err(|e| Error::Manifest {
                name: name.to_string(),
                reason: format!("data key {k:?} is not base64: {e}"),
            })?;
            data.insert(k, decoded);
        }
        for (k, v) in manifest.string_data {
            data.insert(k, v.into_bytes());
        }
        let record_name = if manifest.metadata.name.is_empty() {
            name.to_string()
        } else {
            manifest.metadata.name
        };
        Ok(SecretRecord {
            name: record_name,
            labels: manifest.metadata.labels,
            annotations: manifest.metadata.annotations,
            data,
        })
    }
}

#[async_trait::async_trait]
impl SecretStore for DirSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretRecord>, Error> {
        for ext in ["yaml", "yml"] {
            let path = self.dir.join(format!("{name}.{ext}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => return Self::parse(name, &raw).map(Some),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn list(&self, label: &str) -> Result<Vec<SecretRecord>, Error> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "yaml" && ext != "yml" {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let raw = tokio::fs::read_to_string(&path).await?;
            match Self::parse(&stem, &raw) {
                Ok(record) if record.labels.contains_key(label) => out.push(record),
                Ok(_) => {}
                Err(e) => warn!(record = %stem, "skipping malformed record: {e}"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: v1
kind: Secret
metadata:
  name: staging
  labels:
    cluster.gateway.dev/cluster-credential-type: ServiceAccountToken
  annotations:
    status.cluster.gateway.dev/healthy: "true"
data:
  token: dGVzdC10b2tlbg==
stringData:
  endpoint: https://staging.example.com:6443
"#;

    #[test]
    fn parses_manifest_data_and_string_data() {
        let record = DirSecretStore::parse("staging", MANIFEST).unwrap();
        assert_eq!(record.name, "staging");
        assert_eq!(record.data_str("token"), Some("test-token"));
        assert_eq!(
            record.data_str("endpoint"),
            Some("https://staging.example.com:6443")
        );
        assert_eq!(
            record.labels.get("cluster.gateway.dev/cluster-credential-type"),
            Some(&"ServiceAccountToken".to_string())
        );
    }

    #[test]
    fn rejects_bad_base64() {
        let raw = "metadata:\n  name: x\ndata:\n  token: '*not base64*'\n";
        assert!(matches!(
            DirSecretStore::parse("x", raw),
            Err(Error::Manifest { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemorySecretStore::new();
        let mut record = SecretRecord::named("prod");
        record
            .labels
            .insert("credential-type".to_string(), "X509Certificate".to_string());
        store.insert(record.clone()).await;
        assert_eq!(store.get("prod").await.unwrap(), Some(record));
        assert_eq!(store.get("absent").await.unwrap(), None);
        assert_eq!(store.list("credential-type").await.unwrap().len(), 1);
        assert_eq!(store.list("other-label").await.unwrap().len(), 0);
    }
}
