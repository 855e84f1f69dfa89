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

use std::sync::Arc;

use http::Uri;
use tracing::warn;

use super::{ClusterAccess, ClusterEndpoint, ClusterHealth, ConstEndpoint, Credential};
use crate::config::Config;
use crate::credential::ExecSpec;
use crate::exchange;
use crate::features::FeatureSet;
use crate::secrets::{ClusterRegistry, RegistryEntry, SecretRecord, SecretStore};

const ENDPOINT_TYPE_CONST: &str = "Const";
const ENDPOINT_TYPE_CLUSTER_PROXY: &str = "ClusterProxy";

const CREDENTIAL_TYPE_TOKEN: &str = "ServiceAccountToken";
const CREDENTIAL_TYPE_X509: &str = "X509Certificate";
const CREDENTIAL_TYPE_DYNAMIC: &str = "Dynamic";

#[derive(thiserror::Error, Debug)]
pub enum AccessError {
    #[error("no such cluster {0}")]
    NotFound(String),
    #[error("malformed credential record for cluster {cluster}: {reason}")]
    MalformedSecret { cluster: String, reason: String },
    #[error("no endpoint configured for cluster {0}")]
    MissingEndpoint(String),
    #[error("cluster {cluster} declares credential type {credential_type} but carries no usable data for it")]
    MissingCredentialType {
        cluster: String,
        credential_type: String,
    },
    #[error("unrecognized credential type {value} on cluster {cluster}")]
    UnknownCredentialType { cluster: String, value: String },
    #[error("reading credential record: {0}")]
    Store(#[from] crate::secrets::Error),
}

/// Record keys (labels, annotations, data) derived from the configured API
/// group. Kept separate from [`Config`] so the store can be built in tests
/// without a full flag surface.
#[derive(Debug, Clone)]
pub struct RecordKeys {
    pub credential_type_label: String,
    pub endpoint_type_label: String,
    pub healthy_annotation: String,
    pub healthy_reason_annotation: String,
    pub proxy_configuration_annotation: String,
}

impl RecordKeys {
    pub fn from_config(cfg: &Config) -> Self {
        RecordKeys {
            credential_type_label: cfg.credential_type_label(),
            endpoint_type_label: cfg.endpoint_type_label(),
            healthy_annotation: cfg.healthy_annotation(),
            healthy_reason_annotation: cfg.healthy_reason_annotation(),
            proxy_configuration_annotation: cfg.proxy_configuration_annotation(),
        }
    }

    pub fn for_group(group: &str) -> Self {
        RecordKeys {
            credential_type_label: format!("{group}/cluster-credential-type"),
            endpoint_type_label: format!("{group}/cluster-endpoint-type"),
            healthy_annotation: format!("status.{group}/healthy"),
            healthy_reason_annotation: format!("status.{group}/healthy-reason"),
            proxy_configuration_annotation: format!("{group}/cluster-gateway-proxy-configuration"),
        }
    }
}

/// Assembles immutable [`ClusterAccess`] records from the credential records
/// (and the optional cluster registry) on demand. The store itself holds no
/// per-cluster state; same record bytes always produce an equal access
/// record.
pub struct AccessStore {
    secrets: Arc<dyn SecretStore>,
    registry: Option<Arc<dyn ClusterRegistry>>,
    keys: RecordKeys,
    features: FeatureSet,
}

impl AccessStore {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        registry: Option<Arc<dyn ClusterRegistry>>,
        keys: RecordKeys,
        features: FeatureSet,
    ) -> Self {
        AccessStore {
            secrets,
            registry,
            keys,
            features,
        }
    }

    pub async fn get(&self, name: &str) -> Result<ClusterAccess, AccessError> {
        let secret = self
            .secrets
            .get(name)
            .await?
            .ok_or_else(|| AccessError::NotFound(name.to_string()))?;
        let registry = match &self.registry {
            Some(registry) => registry.get(name).await?,
            None => None,
        };
        self.convert(&secret, registry)
    }

    /// Enumerate every cluster carrying a credential-type label. Records
    /// that fail conversion are skipped with a warning rather than failing
    /// the whole listing.
    pub async fn list(&self) -> Result<Vec<ClusterAccess>, AccessError> {
        let secrets = self.secrets.list(&self.keys.credential_type_label).await?;
        let mut out = Vec::with_capacity(secrets.len());
        for secret in secrets {
            let registry = match &self.registry {
                Some(registry) => registry.get(&secret.name).await?,
                None => None,
            };
            match self.convert(&secret, registry) {
                Ok(access) => out.push(access),
                Err(e) => warn!(cluster = %secret.name, "skipping cluster record: {e}"),
            }
        }
        Ok(out)
    }

    fn convert(
        &self,
        secret: &SecretRecord,
        registry: Option<RegistryEntry>,
    ) -> Result<ClusterAccess, AccessError> {
        let name = secret.name.clone();
        // The credential-type label doubles as the marker distinguishing
        // cluster records from unrelated secrets in the same namespace, so
        // its absence is a NotFound rather than a malformed record.
        let credential_type = secret
            .labels
            .get(&self.keys.credential_type_label)
            .ok_or_else(|| AccessError::NotFound(name.clone()))?
            .clone();
        let endpoint_type = secret
            .labels
            .get(&self.keys.endpoint_type_label)
            .map(String::as_str)
            .unwrap_or(ENDPOINT_TYPE_CONST);

        let endpoint = match endpoint_type {
            ENDPOINT_TYPE_CONST => ClusterEndpoint::Const(self.const_endpoint(secret, registry)?),
            ENDPOINT_TYPE_CLUSTER_PROXY => ClusterEndpoint::Tunnel,
            other => {
                return Err(AccessError::MalformedSecret {
                    cluster: name,
                    reason: format!("unsupported endpoint type {other:?}"),
                })
            }
        };

        let credential = self.credential(secret, &credential_type)?;
        let health = self.health(secret)?;
        let proxy_rules = self.proxy_rules(secret)?;

        Ok(ClusterAccess {
            name,
            endpoint,
            credential,
            health,
            proxy_rules,
        })
    }

    fn const_endpoint(
        &self,
        secret: &SecretRecord,
        registry: Option<RegistryEntry>,
    ) -> Result<ConstEndpoint, AccessError> {
        let name = &secret.name;
        let (address, registry_ca) = match registry {
            Some(entry) => (entry.endpoint, entry.ca_bundle),
            None => {
                let address = secret
                    .data_str("endpoint")
                    .map(|s| s.trim_end_matches('\n').to_string())
                    .ok_or_else(|| AccessError::MissingEndpoint(name.clone()))?;
                (address, None)
            }
        };
        let uri: Uri = address
            .parse()
            .map_err(|e| AccessError::MalformedSecret {
                cluster: name.clone(),
                reason: format!("invalid endpoint {address:?}: {e}"),
            })?;
        if uri.host().is_none() {
            return Err(AccessError::MalformedSecret {
                cluster: name.clone(),
                reason: format!("endpoint {address:?} has no host"),
            });
        }
        let ca_bundle = registry_ca
            .or_else(|| secret.data.get("ca.crt").cloned())
            .or_else(|| secret.data.get("ca").cloned());
        let proxy_url = secret.data_str("proxy-url").map(str::to_string);
        let insecure = ca_bundle.is_none();
        Ok(ConstEndpoint {
            address,
            ca_bundle,
            insecure,
            proxy_url,
        })
    }

    fn credential(
        &self,
        secret: &SecretRecord,
        credential_type: &str,
    ) -> Result<Credential, AccessError> {
        let name = &secret.name;
        let missing = |key: &str| AccessError::MissingCredentialType {
            cluster: name.clone(),
            credential_type: format!("{credential_type} (missing data key {key:?})"),
        };
        match credential_type {
            CREDENTIAL_TYPE_TOKEN => {
                let token = secret
                    .data_str("token")
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| missing("token"))?;
                Ok(Credential::Token(token.to_string()))
            }
            CREDENTIAL_TYPE_X509 => {
                let cert = secret.data.get("tls.crt").ok_or_else(|| missing("tls.crt"))?;
                let key = secret.data.get("tls.key").ok_or_else(|| missing("tls.key"))?;
                Ok(Credential::X509 {
                    cert: cert.clone(),
                    key: key.clone(),
                })
            }
            CREDENTIAL_TYPE_DYNAMIC => {
                let raw = secret.data_str("exec").ok_or_else(|| missing("exec"))?;
                let spec: ExecSpec =
                    serde_json::from_str(raw).map_err(|e| AccessError::MalformedSecret {
                        cluster: name.clone(),
                        reason: format!("invalid exec credential spec: {e}"),
                    })?;
                Ok(Credential::Dynamic(spec))
            }
            other => Err(AccessError::UnknownCredentialType {
                cluster: name.clone(),
                value: other.to_string(),
            }),
        }
    }

    fn health(&self, secret: &SecretRecord) -> Result<ClusterHealth, AccessError> {
        if !self.features.healthiness_check {
            return Ok(ClusterHealth::default());
        }
        let healthy = match secret.annotations.get(&self.keys.healthy_annotation) {
            None => return Ok(ClusterHealth::default()),
            Some(raw) => raw.parse::<bool>().map_err(|_| AccessError::MalformedSecret {
                cluster: secret.name.clone(),
                reason: format!("healthiness annotation is not a boolean: {raw:?}"),
            })?,
        };
        let reason = secret
            .annotations
            .get(&self.keys.healthy_reason_annotation)
            .cloned()
            .unwrap_or_default();
        Ok(ClusterHealth { healthy, reason })
    }

    fn proxy_rules(
        &self,
        secret: &SecretRecord,
    ) -> Result<Option<Vec<exchange::IdentityRule>>, AccessError> {
        if !self.features.client_identity_penetration {
            return Ok(None);
        }
        let Some(raw) = secret
            .annotations
            .get(&self.keys.proxy_configuration_annotation)
        else {
            return Ok(None);
        };
        let mut rules =
            exchange::parse_rules_document(raw).map_err(|e| AccessError::MalformedSecret {
                cluster: secret.name.clone(),
                reason: format!("invalid proxy configuration: {e}"),
            })?;
        // Per-cluster rules only ever apply to the cluster they rode in on.
        for rule in &mut rules {
            if let Some(source) = rule.source.as_mut() {
                source.cluster = Some(secret.name.clone());
            }
        }
        Ok(Some(rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{MemoryClusterRegistry, MemorySecretStore};

    const GROUP: &str = "cluster.gateway.dev";

    fn keys() -> RecordKeys {
        RecordKeys::for_group(GROUP)
    }

    fn token_secret(name: &str) -> SecretRecord {
        let mut secret = SecretRecord::named(name);
        secret.labels.insert(
            format!("{GROUP}/cluster-credential-type"),
            "ServiceAccountToken".to_string(),
        );
        secret
            .data
            .insert("endpoint".to_string(), b"https://foo.bar:33".to_vec());
        secret
            .data
            .insert("ca.crt".to_string(), b"test-ca".to_vec());
        secret
            .data
            .insert("token".to_string(), b"test-token".to_vec());
        secret
    }

    fn store(secrets: Arc<MemorySecretStore>) -> AccessStore {
        AccessStore::new(secrets, None, keys(), FeatureSet::default())
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let s = store(MemorySecretStore::new());
        assert!(matches!(
            s.get("absent").await,
            Err(AccessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn secret_without_credential_label_is_hidden() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("plain");
        secret.labels.clear();
        secrets.insert(secret).await;
        assert!(matches!(
            store(secrets).get("plain").await,
            Err(AccessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn token_const_with_ca() {
        let secrets = MemorySecretStore::new();
        secrets.insert(token_secret("foo")).await;
        let access = store(secrets).get("foo").await.unwrap();
        assert_eq!(access.name, "foo");
        assert_eq!(access.credential, Credential::Token("test-token".into()));
        let ClusterEndpoint::Const(endpoint) = access.endpoint else {
            panic!("expected const endpoint");
        };
        assert_eq!(endpoint.address, "https://foo.bar:33");
        assert_eq!(endpoint.ca_bundle.as_deref(), Some(b"test-ca".as_ref()));
        assert!(!endpoint.insecure);
    }

    #[tokio::test]
    async fn missing_ca_implies_insecure() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("bar");
        secret.data.remove("ca.crt");
        secrets.insert(secret).await;
        let access = store(secrets).get("bar").await.unwrap();
        let ClusterEndpoint::Const(endpoint) = access.endpoint else {
            panic!("expected const endpoint");
        };
        assert!(endpoint.insecure);
        assert!(endpoint.ca_bundle.is_none());
    }

    #[tokio::test]
    async fn ca_falls_back_to_short_key() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("baz");
        secret.data.remove("ca.crt");
        secret.data.insert("ca".to_string(), b"alt-ca".to_vec());
        secrets.insert(secret).await;
        let access = store(secrets).get("baz").await.unwrap();
        let ClusterEndpoint::Const(endpoint) = access.endpoint else {
            panic!("expected const endpoint");
        };
        assert_eq!(endpoint.ca_bundle.as_deref(), Some(b"alt-ca".as_ref()));
        assert!(!endpoint.insecure);
    }

    #[tokio::test]
    async fn registry_endpoint_takes_precedence() {
        let secrets = MemorySecretStore::new();
        secrets.insert(token_secret("reg")).await;
        let registry = MemoryClusterRegistry::new();
        registry
            .insert(
                "reg",
                RegistryEntry {
                    endpoint: "https://managed.example.com:6443".to_string(),
                    ca_bundle: Some(b"registry-ca".to_vec()),
                },
            )
            .await;
        let s = AccessStore::new(secrets, Some(registry), keys(), FeatureSet::default());
        let access = s.get("reg").await.unwrap();
        let ClusterEndpoint::Const(endpoint) = access.endpoint else {
            panic!("expected const endpoint");
        };
        assert_eq!(endpoint.address, "https://managed.example.com:6443");
        assert_eq!(endpoint.ca_bundle.as_deref(), Some(b"registry-ca".as_ref()));
    }

    #[tokio::test]
    async fn tunnel_endpoint_has_no_address() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("my-cluster");
        secret.data.remove("endpoint");
        secret.labels.insert(
            format!("{GROUP}/cluster-endpoint-type"),
            "ClusterProxy".to_string(),
        );
        secrets.insert(secret).await;
        let access = store(secrets).get("my-cluster").await.unwrap();
        assert_eq!(access.endpoint, ClusterEndpoint::Tunnel);
    }

    #[tokio::test]
    async fn const_without_endpoint_is_rejected() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("nowhere");
        secret.data.remove("endpoint");
        secrets.insert(secret).await;
        assert!(matches!(
            store(secrets).get("nowhere").await,
            Err(AccessError::MissingEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn x509_requires_both_halves() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("certs");
        secret.labels.insert(
            format!("{GROUP}/cluster-credential-type"),
            "X509Certificate".to_string(),
        );
        secret.data.insert("tls.crt".to_string(), b"cert".to_vec());
        secrets.insert(secret).await;
        let s = store(secrets.clone());
        assert!(matches!(
            s.get("certs").await,
            Err(AccessError::MissingCredentialType { .. })
        ));

        let mut secret = token_secret("certs");
        secret.labels.insert(
            format!("{GROUP}/cluster-credential-type"),
            "X509Certificate".to_string(),
        );
        secret.data.insert("tls.crt".to_string(), b"cert".to_vec());
        secret.data.insert("tls.key".to_string(), b"key".to_vec());
        secrets.insert(secret).await;
        let access = s.get("certs").await.unwrap();
        assert_eq!(
            access.credential,
            Credential::X509 {
                cert: b"cert".to_vec(),
                key: b"key".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn unknown_credential_type_is_rejected() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("odd");
        secret.labels.insert(
            format!("{GROUP}/cluster-credential-type"),
            "Kerberos".to_string(),
        );
        secrets.insert(secret).await;
        assert!(matches!(
            store(secrets).get("odd").await,
            Err(AccessError::UnknownCredentialType { .. })
        ));
    }

    #[tokio::test]
    async fn dynamic_credential_parses_exec_spec() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("dyn");
        secret.labels.insert(
            format!("{GROUP}/cluster-credential-type"),
            "Dynamic".to_string(),
        );
        secret.data.insert(
            "exec".to_string(),
            br#"{"apiVersion":"client.authentication.k8s.io/v1","command":"aws-iam-authenticator","args":["token"]}"#
                .to_vec(),
        );
        secrets.insert(secret).await;
        let access = store(secrets).get("dyn").await.unwrap();
        let Credential::Dynamic(spec) = access.credential else {
            panic!("expected dynamic credential");
        };
        assert_eq!(spec.command, "aws-iam-authenticator");
        assert_eq!(spec.args, vec!["token".to_string()]);
    }

    #[tokio::test]
    async fn healthiness_annotations_are_gated() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("sick");
        secret.annotations.insert(
            format!("status.{GROUP}/healthy"),
            "false".to_string(),
        );
        secret.annotations.insert(
            format!("status.{GROUP}/healthy-reason"),
            "apiserver unreachable".to_string(),
        );
        secrets.insert(secret).await;

        // gate off: annotations ignored
        let access = store(secrets.clone()).get("sick").await.unwrap();
        assert!(access.health.allows_proxy());

        // gate on: annotations honoured
        let features = FeatureSet {
            healthiness_check: true,
            ..FeatureSet::default()
        };
        let s = AccessStore::new(secrets, None, keys(), features);
        let access = s.get("sick").await.unwrap();
        assert!(!access.health.allows_proxy());
        assert_eq!(access.health.reason, "apiserver unreachable");
    }

    #[tokio::test]
    async fn per_cluster_rules_are_scoped_to_their_cluster() {
        let secrets = MemorySecretStore::new();
        let mut secret = token_secret("ruled");
        secret.annotations.insert(
            format!("{GROUP}/cluster-gateway-proxy-configuration"),
            concat!(
                "spec:\n",
                "  clientIdentityExchanger:\n",
                "    rules:\n",
                "    - name: local\n",
                "      type: StaticMapping\n",
                "      source:\n",
                "        group: g\n",
                "      target:\n",
                "        user: L\n",
            )
            .to_string(),
        );
        secrets.insert(secret).await;
        let features = FeatureSet {
            client_identity_penetration: true,
            ..FeatureSet::default()
        };
        let s = AccessStore::new(secrets, None, keys(), features);
        let access = s.get("ruled").await.unwrap();
        let rules = access.proxy_rules.expect("rules parsed");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].source.as_ref().unwrap().cluster.as_deref(),
            Some("ruled")
        );
    }

    #[tokio::test]
    async fn conversion_is_deterministic() {
        let secrets = MemorySecretStore::new();
        secrets.insert(token_secret("same")).await;
        let s = store(secrets);
        let a = s.get("same").await.unwrap();
        let b = s.get("same").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn list_skips_malformed_records() {
        let secrets = MemorySecretStore::new();
        secrets.insert(token_secret("good")).await;
        let mut bad = token_secret("bad");
        bad.data.remove("endpoint");
        secrets.insert(bad).await;
        let listed = store(secrets).list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "good");
    }
}
