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

//! The request plane: per-request proxying to a target cluster.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::Response;

pub mod escaper;
mod handler;
mod upgrade;

pub use escaper::RequestEscaper;
pub use handler::ProxyHandler;

pub type BoxBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

/// Request-plane failures, each mapping to the status code surfaced to the
/// client. Reasons for `BadCredential` stay opaque to the client; the
/// detail is logged server-side only.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such cluster {0}")]
    NoSuchCluster(String),
    #[error("malformed credential record for cluster {0}")]
    MalformedRecord(String),
    #[error("cluster {cluster} is unhealthy: {reason}")]
    Unhealthy { cluster: String, reason: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("failed materialising access for cluster {0}")]
    BadCredential(String),
    #[error("error reaching cluster {cluster}: {detail}")]
    Upstream { cluster: String, detail: String },
    #[error("request to cluster {cluster} timed out after {timeout:?}")]
    Timeout { cluster: String, timeout: Duration },
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoSuchCluster(_) | Error::MalformedRecord(_) => StatusCode::NOT_FOUND,
            Error::Unhealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::BadCredential(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<crate::access::AccessError> for Error {
    fn from(e: crate::access::AccessError) -> Self {
        use crate::access::AccessError;
        match e {
            AccessError::NotFound(name) => Error::NoSuchCluster(name),
            AccessError::MalformedSecret { cluster, .. } => Error::MalformedRecord(cluster),
            AccessError::MissingEndpoint(cluster) => Error::MalformedRecord(cluster),
            AccessError::MissingCredentialType { cluster, .. } => Error::MalformedRecord(cluster),
            AccessError::UnknownCredentialType { cluster, .. } => Error::MalformedRecord(cluster),
            AccessError::Store(e) => Error::BadRequest(format!("reading cluster records: {e}")),
        }
    }
}

/// Writes terminal errors back to the client. The host framework may
/// substitute its own to unify error reporting; the default emits a
/// Kubernetes-style Status document.
pub trait Responder: Send + Sync {
    fn error(&self, err: &Error) -> Response<BoxBody>;
}

#[derive(Default)]
pub struct StatusResponder;

impl Responder for StatusResponder {
    fn error(&self, err: &Error) -> Response<BoxBody> {
        let status = err.status();
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": err.to_string(),
            "code": status.as_u16(),
        });
        Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full_body(body.to_string()))
            .expect("static response")
    }
}

/// The proxy subresource options, read from the front-door query before
/// escaping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Subpath inside the target cluster's API surface.
    pub path: String,
    /// Whether to run identity projection for this request.
    pub impersonate: bool,
    /// Whether the framework saw a watch parameter; watches are exempt
    /// from the transport timeout.
    pub watch: bool,
}

impl ProxyOptions {
    pub fn from_query(query: &str) -> ProxyOptions {
        let mut options = ProxyOptions::default();
        for fragment in query.split('&') {
            let (key, value) = match fragment.split_once('=') {
                Some((k, v)) => (k, v),
                None => (fragment, ""),
            };
            match key {
                "path" => options.path = percent_decode(value),
                "impersonate" => options.impersonate = matches!(value, "true" | "1"),
                "watch" => options.watch = matches!(value, "true" | "1"),
                _ => {}
            }
        }
        options
    }
}

/// A front-door path resolved to its target cluster and passthrough
/// remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub cluster: String,
    /// Path remainder after the `/proxy` segment, keeping its leading
    /// slash; empty when the request addressed `/proxy` itself.
    pub remainder: String,
}

/// Match `/apis/<group>/<version>/clustergateways/<name>/proxy[/...]`.
pub fn parse_route(path: &str, api_group: &str, api_version: &str) -> Option<ProxyRoute> {
    let rest = path.strip_prefix("/apis/")?;
    let rest = rest.strip_prefix(api_group)?.strip_prefix('/')?;
    let rest = rest.strip_prefix(api_version)?.strip_prefix('/')?;
    let rest = rest.strip_prefix("clustergateways/")?;
    let (cluster, rest) = match rest.split_once('/') {
        Some((cluster, rest)) => (cluster, rest),
        None => return None,
    };
    if cluster.is_empty() {
        return None;
    }
    let remainder = match rest.strip_prefix("proxy") {
        Some(r) if r.is_empty() || r.starts_with('/') => r,
        _ => return None,
    };
    Some(ProxyRoute {
        cluster: cluster.to_string(),
        remainder: remainder.to_string(),
    })
}

/// Join path pieces with single slashes, treating empty pieces as absent.
pub(crate) fn join_paths(pieces: &[&str]) -> String {
    let mut out = String::new();
    for piece in pieces {
        if piece.is_empty() || *piece == "/" {
            continue;
        }
        let piece = piece.trim_end_matches('/');
        if !piece.starts_with('/') {
            out.push('/');
        }
        out.push_str(piece);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

pub(crate) fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
