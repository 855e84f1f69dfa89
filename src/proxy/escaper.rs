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

//! Query-key escaping for the proxy subresource.
//!
//! A reserved set of query keys is consumed by the gateway itself and never
//! reaches the target cluster. Clients that need one of those names
//! upstream double-underscore it (`__watch=1`); this middleware, installed
//! in front of the handler chain, removes the prefix once the outer layers
//! have read the originals, and drops the plain reserved keys they
//! consumed.

use http::uri::PathAndQuery;
use http::{Request, Uri};
use regex::Regex;

/// Query keys the gateway and its host framework consume.
const RESERVED_QUERY_KEYS: &[&str] = &[
    "path",
    "impersonate",
    "watch",
    "timeout",
    "timeoutSeconds",
    "resourceVersion",
    "resourceVersionMatch",
    "continue",
    "limit",
    "allowWatchBookmarks",
    "labelSelector",
    "fieldSelector",
    "pretty",
];

const ESCAPE_PREFIX: &str = "__";

pub struct RequestEscaper {
    proxy_path: Regex,
}

impl RequestEscaper {
    pub fn new(api_group: &str, api_version: &str) -> Self {
        let pattern = format!(
            "^/apis/{}/{}/clustergateways/[a-z0-9]([-a-z0-9]*[a-z0-9])?/proxy(/|$)",
            regex::escape(api_group),
            regex::escape(api_version),
        );
        RequestEscaper {
            proxy_path: Regex::new(&pattern).expect("static pattern compiles"),
        }
    }

    /// Rewrite a request in place. Requests outside the proxy prefix are
    /// untouched.
    pub fn apply<B>(&self, req: &mut Request<B>) {
        let uri = req.uri();
        let path = uri.path();
        if !self.proxy_path.is_match(path) {
            return;
        }
        let Some(query) = uri.query() else {
            return;
        };
        let rewritten = escape_query(query);
        let path_and_query = if rewritten.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{rewritten}")
        };
        let Ok(path_and_query) = path_and_query.parse::<PathAndQuery>() else {
            return;
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        if let Ok(uri) = Uri::from_parts(parts) {
            *req.uri_mut() = uri;
        }
    }
}

/// `__k=v` becomes `k=v`; plain reserved keys are dropped; everything else
/// passes through verbatim, order preserved.
fn escape_query(query: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    for fragment in query.split('&') {
        if fragment.is_empty() {
            continue;
        }
        let key = fragment.split('=').next().unwrap_or(fragment);
        if let Some(unescaped) = key.strip_prefix(ESCAPE_PREFIX) {
            let rest = &fragment[key.len()..];
            kept.push(format!("{unescaped}{rest}"));
        } else if RESERVED_QUERY_KEYS.contains(&key) {
            continue;
        } else {
            kept.push(fragment.to_string());
        }
    }
    kept.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY_PATH: &str =
        "/apis/cluster.gateway.dev/v1alpha1/clustergateways/my-cluster/proxy/api/v1/pods";

    fn escaper() -> RequestEscaper {
        RequestEscaper::new("cluster.gateway.dev", "v1alpha1")
    }

    fn rewrite(path_and_query: &str) -> String {
        let mut req = Request::builder()
            .uri(path_and_query)
            .body(())
            .expect("request");
        escaper().apply(&mut req);
        req.uri().to_string()
    }

    #[test]
    fn unescapes_double_underscore_keys() {
        let uri = rewrite(&format!(
            "{PROXY_PATH}?__dryRun=All&fieldValidation=Strict&watch=1"
        ));
        assert_eq!(
            uri,
            format!("{PROXY_PATH}?dryRun=All&fieldValidation=Strict")
        );
    }

    #[test]
    fn escaped_reserved_keys_reach_the_target() {
        let uri = rewrite(&format!("{PROXY_PATH}?__watch=1&__labelSelector=a%3Db"));
        assert_eq!(uri, format!("{PROXY_PATH}?watch=1&labelSelector=a%3Db"));
    }

    #[test]
    fn reserved_keys_are_consumed() {
        let uri = rewrite(&format!(
            "{PROXY_PATH}?watch=1&timeout=30s&resourceVersion=5&path=%2Fhealthz"
        ));
        assert_eq!(uri, PROXY_PATH);
    }

    #[test]
    fn untouched_outside_the_proxy_prefix() {
        let original = "/api/v1/pods?__dryRun=All&watch=1";
        assert_eq!(rewrite(original), original);

        let other_subresource =
            "/apis/cluster.gateway.dev/v1alpha1/clustergateways/my-cluster/health?watch=1";
        assert_eq!(rewrite(other_subresource), other_subresource);
    }

    #[test]
    fn idempotent_outside_and_applies_once_inside() {
        // outside: applying twice changes nothing
        let outside = "/healthz?__watch=1";
        assert_eq!(rewrite(&rewrite(outside)), outside);

        // inside: the prefix is dropped exactly once
        let inside = format!("{PROXY_PATH}?__fieldValidation=Strict");
        let once = rewrite(&inside);
        assert_eq!(once, format!("{PROXY_PATH}?fieldValidation=Strict"));
    }

    #[test]
    fn query_free_requests_pass_through() {
        assert_eq!(rewrite(PROXY_PATH), PROXY_PATH);
    }

    #[test]
    fn matches_proxy_root_without_trailing_path() {
        let uri = rewrite(
            "/apis/cluster.gateway.dev/v1alpha1/clustergateways/my-cluster/proxy?watch=1&__pretty=true",
        );
        assert_eq!(
            uri,
            "/apis/cluster.gateway.dev/v1alpha1/clustergateways/my-cluster/proxy?pretty=true"
        );
    }

    #[test]
    fn value_free_fragments_are_preserved() {
        let uri = rewrite(&format!("{PROXY_PATH}?flag&__verbose"));
        assert_eq!(uri, format!("{PROXY_PATH}?flag&verbose"));
    }
}
