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

//! Short-lived credentials minted by an external command.
//!
//! A cluster record may declare a `Dynamic` credential: a JSON spec naming a
//! binary that, when run, prints an `ExecCredential` document on stdout. The
//! issuer runs the binary; the cache memoises its output per cluster until
//! shortly before expiry.

mod cache;
mod exec;

pub use cache::{CredentialCache, EXPIRY_MARGIN};
pub use exec::ExecIssuer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const API_VERSION_V1: &str = "client.authentication.k8s.io/v1";
pub const API_VERSION_V1BETA1: &str = "client.authentication.k8s.io/v1beta1";

/// Declaration of the external command, as carried in a record's `exec`
/// data key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    pub api_version: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<ExecEnvVar>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

/// The document an exec plugin prints on stdout.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub status: Option<ExecCredentialStatus>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    pub token: Option<String>,
    /// PEM text of the client certificate.
    pub client_certificate_data: Option<String>,
    /// PEM text of the client key.
    pub client_key_data: Option<String>,
    pub expiration_timestamp: Option<DateTime<Utc>>,
}

/// A validated, materialised credential: either a bearer token or a client
/// certificate pair, with an optional expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCredential {
    pub token: Option<String>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(thiserror::Error, Debug)]
pub enum IssueError {
    #[error("exec: executable {0} not found")]
    BinaryNotFound(String),
    #[error("exec: executable {command} failed with exit code {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("exec: decoding stdout: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("exec plugin is configured to use API version {expected}, plugin returned version {got}")]
    VersionMismatch { expected: String, got: String },
    #[error("exec plugin didn't return a status field")]
    MissingStatus,
    #[error("exec plugin didn't return a token or cert/key pair")]
    NoCredential,
    #[error("exec plugin returned only certificate or key, not both")]
    HalfPair,
    #[error("exec plugin: invalid apiVersion {0:?}")]
    InvalidApiVersion(String),
    #[error("exec: {0}")]
    Io(#[from] std::io::Error),
}

/// Issues a credential from a spec. The process-backed implementation is
/// [`ExecIssuer`]; tests substitute their own.
#[async_trait::async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, spec: &ExecSpec) -> Result<IssuedCredential, IssueError>;
}
