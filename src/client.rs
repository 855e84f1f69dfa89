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

//! Helpers for clients addressing clusters through the gateway.
//!
//! A caller tags a request with the target cluster, and the rewriter folds
//! the original path into the gateway's front-door shape. Two flavours
//! exist: the default falls back to the hosting cluster when no tag is
//! present (clients doing implicit API discovery need this), the strict
//! flavour refuses such requests.

use http::uri::PathAndQuery;
use http::{Request, Uri};

/// Request extension naming the target cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterName(pub String);

/// Tag a request with its target cluster.
pub fn with_cluster<B>(req: &mut Request<B>, cluster: impl Into<String>) {
    req.extensions_mut().insert(ClusterName(cluster.into()));
}

#[derive(thiserror::Error, Debug)]
pub enum RewriteError {
    #[error("missing cluster name in the request context")]
    MissingCluster,
    #[error("request target {0:?} cannot be rewritten")]
    InvalidTarget(String),
}

pub struct PathRewriter {
    api_group: String,
    api_version: String,
    fallback: bool,
}

impl PathRewriter {
    /// Fallback flavour: untagged requests pass through to the hosting
    /// cluster unchanged.
    pub fn new(api_group: impl Into<String>, api_version: impl Into<String>) -> Self {
        PathRewriter {
            api_group: api_group.into(),
            api_version: api_version.into(),
            fallback: true,
        }
    }

    /// Strict flavour: untagged requests are an error. The `_fallback`
    /// argument is accepted for signature compatibility with existing
    /// callers and deliberately ignored; a strict rewriter never falls
    /// back.
    pub fn strict(
        api_group: impl Into<String>,
        api_version: impl Into<String>,
        _fallback: bool,
    ) -> Self {
        PathRewriter {
            api_group: api_group.into(),
            api_version: api_version.into(),
            fallback: false,
        }
    }

    pub fn rewrite<B>(&self, mut req: Request<B>) -> Result<Request<B>, RewriteError> {
        let Some(ClusterName(cluster)) = req.extensions().get::<ClusterName>().cloned() else {
            if self.fallback {
                return Ok(req);
            }
            return Err(RewriteError::MissingCluster);
        };
        let original = req.uri().clone();
        let path = original.path().trim_start_matches('/');
        let rewritten = format!(
            "/apis/{}/{}/clustergateways/{}/proxy/{}",
            self.api_group, self.api_version, cluster, path
        );
        let path_and_query = match original.query() {
            Some(query) => format!("{rewritten}?{query}"),
            None => rewritten,
        };
        let path_and_query: PathAndQuery = path_and_query
            .parse()
            .map_err(|_| RewriteError::InvalidTarget(original.to_string()))?;
        let mut parts = original.into_parts();
        parts.path_and_query = Some(path_and_query);
        let uri =
            Uri::from_parts(parts).map_err(|e| RewriteError::InvalidTarget(e.to_string()))?;
        *req.uri_mut() = uri;
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> PathRewriter {
        PathRewriter::new("cluster.gateway.dev", "v1alpha1")
    }

    #[test]
    fn rewrites_tagged_requests() {
        let mut req = Request::builder()
            .uri("/api/v1/pods?labelSelector=app%3Dweb")
            .body(())
            .unwrap();
        with_cluster(&mut req, "prod");
        let req = rewriter().rewrite(req).unwrap();
        assert_eq!(
            req.uri().to_string(),
            "/apis/cluster.gateway.dev/v1alpha1/clustergateways/prod/proxy/api/v1/pods?labelSelector=app%3Dweb"
        );
    }

    #[test]
    fn fallback_passes_untagged_requests_through() {
        let req = Request::builder().uri("/version").body(()).unwrap();
        let req = rewriter().rewrite(req).unwrap();
        assert_eq!(req.uri().to_string(), "/version");
    }

    #[test]
    fn strict_rejects_untagged_requests_regardless_of_flag() {
        for flag in [true, false] {
            let rewriter = PathRewriter::strict("cluster.gateway.dev", "v1alpha1", flag);
            let req = Request::builder().uri("/version").body(()).unwrap();
            assert!(matches!(
                rewriter.rewrite(req),
                Err(RewriteError::MissingCluster)
            ));
        }
    }

    #[test]
    fn strict_rewrites_tagged_requests() {
        let rewriter = PathRewriter::strict("cluster.gateway.dev", "v1alpha1", true);
        let mut req = Request::builder().uri("/healthz").body(()).unwrap();
        with_cluster(&mut req, "edge-1");
        let req = rewriter.rewrite(req).unwrap();
        assert_eq!(
            req.uri().path(),
            "/apis/cluster.gateway.dev/v1alpha1/clustergateways/edge-1/proxy/healthz"
        );
    }

    #[test]
    fn absolute_uris_keep_scheme_and_authority() {
        let mut req = Request::builder()
            .uri("https://gateway.example.com:9443/api/v1/pods")
            .body(())
            .unwrap();
        with_cluster(&mut req, "prod");
        let req = rewriter().rewrite(req).unwrap();
        assert_eq!(
            req.uri().to_string(),
            "https://gateway.example.com:9443/apis/cluster.gateway.dev/v1alpha1/clustergateways/prod/proxy/api/v1/pods"
        );
    }
}
