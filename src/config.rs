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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::features::FeatureSet;

/// Transport-wide timeout for non-upgrade, non-watch proxied requests.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(40);

/// Upper bound on client-visible latency of streamed response frames.
/// Hyper flushes each frame as it is written, so this bound holds without a
/// dedicated flush timer; the constant documents the contract.
pub const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

const DEFAULT_API_GROUP: &str = "cluster.gateway.dev";
const DEFAULT_API_VERSION: &str = "v1alpha1";

/// CLI surface of the gateway process. Everything here can also be supplied
/// through the environment, uppercased with a `GATEWAY_` prefix.
#[derive(Parser, Debug, Clone)]
#[command(name = "cluster-gateway", about = "Multi-cluster API gateway")]
pub struct Args {
    /// Address the proxy front door listens on.
    #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Address the admin endpoint (metrics, health) listens on.
    #[arg(long, env = "GATEWAY_ADMIN_BIND", default_value = "127.0.0.1:15020")]
    pub admin_bind: SocketAddr,

    /// API group served under /apis/<group>/<version>/clustergateways.
    #[arg(long, env = "GATEWAY_API_GROUP", default_value = DEFAULT_API_GROUP)]
    pub api_group: String,

    /// API version served under /apis/<group>/<version>/clustergateways.
    #[arg(long, env = "GATEWAY_API_VERSION", default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Namespace cluster credential records are read from.
    #[arg(long = "secret-namespace", env = "GATEWAY_SECRET_NAMESPACE")]
    pub secret_namespace: Option<String>,

    /// Directory of cluster credential records (YAML), for running without a
    /// hosting control plane. Mutually exclusive with --secret-namespace.
    #[arg(long = "secret-dir", env = "GATEWAY_SECRET_DIR")]
    pub secret_dir: Option<PathBuf>,

    /// Host of the cluster proxy (tunnelled egress) endpoint.
    #[arg(long = "proxy-host", env = "GATEWAY_PROXY_HOST")]
    pub proxy_host: Option<String>,

    /// Port of the cluster proxy endpoint.
    #[arg(long = "proxy-port", env = "GATEWAY_PROXY_PORT", default_value_t = 8090)]
    pub proxy_port: u16,

    /// Path to the CA bundle for verifying the cluster proxy.
    #[arg(long = "proxy-ca-cert", env = "GATEWAY_PROXY_CA_CERT")]
    pub proxy_ca_cert: Option<PathBuf>,

    /// Path to the client certificate presented to the cluster proxy.
    #[arg(long = "proxy-cert", env = "GATEWAY_PROXY_CERT")]
    pub proxy_cert: Option<PathBuf>,

    /// Path to the client key presented to the cluster proxy.
    #[arg(long = "proxy-key", env = "GATEWAY_PROXY_KEY")]
    pub proxy_key: Option<PathBuf>,

    /// Perform an additional delegated authorization against the hosting
    /// control plane for the target proxying path.
    #[arg(long = "authorize-proxy-subpath", env = "GATEWAY_AUTHORIZE_PROXY_SUBPATH")]
    pub authorize_proxy_subpath: bool,

    /// UserAgent for communicating with the hosting control plane.
    #[arg(long = "user-agent", env = "GATEWAY_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Path to the global identity exchanger rule file (YAML).
    #[arg(long = "identity-rules", env = "GATEWAY_IDENTITY_RULES")]
    pub identity_rules: Option<PathBuf>,

    /// Comma separated feature gates, e.g.
    /// "HealthinessCheck=true,ClientIdentityPenetration=true".
    #[arg(long = "feature-gates", env = "GATEWAY_FEATURE_GATES", default_value = "")]
    pub feature_gates: String,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("one of --secret-namespace or --secret-dir must be specified")]
    MissingSecretSource,
    #[error("--secret-namespace and --secret-dir are mutually exclusive")]
    ConflictingSecretSource,
    #[error("--proxy-port must be greater than 0")]
    MissingProxyPort,
    #[error("--proxy-ca-cert must be specified")]
    MissingProxyCa,
    #[error("--proxy-cert must be specified")]
    MissingProxyCert,
    #[error("--proxy-key must be specified")]
    MissingProxyKey,
    #[error("invalid feature gate {0:?}")]
    FeatureGate(String),
}

/// Where cluster credential records come from.
#[derive(Debug, Clone)]
pub enum SecretSource {
    /// A namespace in the hosting control plane, served through the host
    /// framework's shared cache.
    Namespace(String),
    /// A local directory of record manifests, one YAML document per cluster.
    Directory(PathBuf),
}

/// Connection parameters for the tunnelled egress proxy.
#[derive(Debug, Clone)]
pub struct ClusterProxyConfig {
    pub host: String,
    pub port: u16,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub admin_bind: SocketAddr,
    pub api_group: String,
    pub api_version: String,
    pub secret_source: SecretSource,
    pub cluster_proxy: Option<ClusterProxyConfig>,
    pub authorize_proxy_subpath: bool,
    pub user_agent: Option<String>,
    pub identity_rules: Option<PathBuf>,
    pub features: FeatureSet,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Config, Error> {
        let secret_source = match (args.secret_namespace, args.secret_dir) {
            (Some(_), Some(_)) => return Err(Error::ConflictingSecretSource),
            (Some(ns), None) => SecretSource::Namespace(ns),
            (None, Some(dir)) => SecretSource::Directory(dir),
            (None, None) => return Err(Error::MissingSecretSource),
        };
        let cluster_proxy = match args.proxy_host {
            None => None,
            Some(host) => {
                if args.proxy_port == 0 {
                    return Err(Error::MissingProxyPort);
                }
                Some(ClusterProxyConfig {
                    host,
                    port: args.proxy_port,
                    ca_file: args.proxy_ca_cert.ok_or(Error::MissingProxyCa)?,
                    cert_file: args.proxy_cert.ok_or(Error::MissingProxyCert)?,
                    key_file: args.proxy_key.ok_or(Error::MissingProxyKey)?,
                })
            }
        };
        let features = FeatureSet::parse(&args.feature_gates).map_err(Error::FeatureGate)?;
        Ok(Config {
            bind: args.bind,
            admin_bind: args.admin_bind,
            api_group: args.api_group,
            api_version: args.api_version,
            secret_source,
            cluster_proxy,
            authorize_proxy_subpath: args.authorize_proxy_subpath,
            user_agent: args.user_agent,
            identity_rules: args.identity_rules,
            features,
        })
    }

    /// Label carrying the credential type on a cluster record.
    pub fn credential_type_label(&self) -> String {
        format!("{}/cluster-credential-type", self.api_group)
    }

    /// Label carrying the endpoint type on a cluster record.
    pub fn endpoint_type_label(&self) -> String {
        format!("{}/cluster-endpoint-type", self.api_group)
    }

    /// Annotation carrying the healthiness boolean.
    pub fn healthy_annotation(&self) -> String {
        format!("status.{}/healthy", self.api_group)
    }

    /// Annotation carrying the healthiness reason.
    pub fn healthy_reason_annotation(&self) -> String {
        format!("status.{}/healthy-reason", self.api_group)
    }

    /// Annotation carrying the per-cluster proxy (identity exchanger) rules.
    pub fn proxy_configuration_annotation(&self) -> String {
        format!("{}/cluster-gateway-proxy-configuration", self.api_group)
    }

    /// The front-door path prefix up to the cluster name segment.
    pub fn api_prefix(&self) -> String {
        format!(
            "/apis/{}/{}/clustergateways/",
            self.api_group, self.api_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from([
            "cluster-gateway",
            "--secret-namespace",
            "open-cluster-management",
        ])
    }

    #[test]
    fn secret_source_is_required() {
        let args = Args::parse_from(["cluster-gateway"]);
        assert!(matches!(
            Config::from_args(args),
            Err(Error::MissingSecretSource)
        ));
    }

    #[test]
    fn cluster_proxy_requires_credentials() {
        let mut args = base_args();
        args.proxy_host = Some("proxy-entrypoint".to_string());
        assert!(matches!(Config::from_args(args), Err(Error::MissingProxyCa)));

        let mut args = base_args();
        args.proxy_host = Some("proxy-entrypoint".to_string());
        args.proxy_ca_cert = Some("/certs/ca.crt".into());
        args.proxy_cert = Some("/certs/tls.crt".into());
        args.proxy_key = Some("/certs/tls.key".into());
        let cfg = Config::from_args(args).unwrap();
        let proxy = cfg.cluster_proxy.unwrap();
        assert_eq!(proxy.port, 8090);
    }

    #[test]
    fn record_keys_follow_api_group() {
        let cfg = Config::from_args(base_args()).unwrap();
        assert_eq!(
            cfg.credential_type_label(),
            "cluster.gateway.dev/cluster-credential-type"
        );
        assert_eq!(
            cfg.healthy_annotation(),
            "status.cluster.gateway.dev/healthy"
        );
        assert_eq!(
            cfg.api_prefix(),
            "/apis/cluster.gateway.dev/v1alpha1/clustergateways/"
        );
    }
}
