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

//! The cluster access model: everything needed to reach and authenticate
//! against one remote cluster, derived from its credential record.

use crate::credential::ExecSpec;
use crate::exchange::IdentityRule;

mod store;
pub use store::{AccessError, AccessStore, RecordKeys};

/// Value object describing how to reach one remote cluster. Built per
/// request and immutable afterwards; requests never share a mutable copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAccess {
    /// Unique cluster identifier. Doubles as the host-header value for
    /// tunnelled egress.
    pub name: String,
    pub endpoint: ClusterEndpoint,
    pub credential: Credential,
    pub health: ClusterHealth,
    /// Per-cluster identity exchanger rules, overriding the global set.
    pub proxy_rules: Option<Vec<IdentityRule>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEndpoint {
    /// Fixed endpoint: a fully qualified https URL, reached directly
    /// (optionally through an intermediate HTTP/SOCKS proxy).
    Const(ConstEndpoint),
    /// No address: routed through the egress tunnel, with the cluster name
    /// as both the dialled host and the synthesised TLS server name.
    Tunnel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstEndpoint {
    pub address: String,
    /// Serving CA bundle (PEM). Present implies TLS verification on.
    pub ca_bundle: Option<Vec<u8>>,
    /// Absent CA implies insecure; the store maintains this invariant.
    pub insecure: bool,
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    Token(String),
    X509 { cert: Vec<u8>, key: Vec<u8> },
    /// Resolved lazily through the exec credential issuer at request time.
    Dynamic(ExecSpec),
}

/// Advisory healthiness carried on the record by the health controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHealth {
    pub healthy: bool,
    pub reason: String,
}

impl Default for ClusterHealth {
    fn default() -> Self {
        ClusterHealth {
            healthy: true,
            reason: String::new(),
        }
    }
}

impl ClusterHealth {
    /// The health gate: whether proxying to this cluster is allowed when
    /// the HealthinessCheck feature is on.
    pub fn allows_proxy(&self) -> bool {
        self.healthy
    }
}
