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

//! Delegated authorization of the proxied subpath.
//!
//! The proxied path is parsed into the attribute record a Kubernetes-style
//! authorizer expects (resource/subresource/namespace/name/verb, or a
//! non-resource path), and handed to the host's delegated authorizer. The
//! gateway itself never decides; it only asks.

use http::Method;

use crate::identity::UserIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAttributes {
    Resource {
        verb: String,
        api_group: String,
        api_version: String,
        namespace: String,
        resource: String,
        subresource: String,
        name: String,
    },
    NonResource {
        verb: String,
        path: String,
    },
}

impl RequestAttributes {
    /// The resource label recorded by the metrics sink; empty for
    /// non-resource paths.
    pub fn resource(&self) -> &str {
        match self {
            RequestAttributes::Resource { resource, .. } => resource,
            RequestAttributes::NonResource { .. } => "",
        }
    }

    pub fn verb(&self) -> &str {
        match self {
            RequestAttributes::Resource { verb, .. } => verb,
            RequestAttributes::NonResource { verb, .. } => verb,
        }
    }
}

/// Parse a proxied path into authorization attributes.
///
/// `watching` reflects the `watch` query parameter the framework consumed
/// from the original request.
pub fn parse_attributes(method: &Method, path: &str, watching: bool) -> RequestAttributes {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let (api_group, api_version, rest) = match segments.first() {
        Some(&"api") if segments.len() >= 2 => (String::new(), segments[1].to_string(), &segments[2..]),
        Some(&"apis") if segments.len() >= 3 => {
            (segments[1].to_string(), segments[2].to_string(), &segments[3..])
        }
        _ => {
            return RequestAttributes::NonResource {
                verb: method.as_str().to_lowercase(),
                path: path.to_string(),
            }
        }
    };

    let (namespace, rest) = match rest.first() {
        Some(&"namespaces") if rest.len() >= 2 => (rest[1].to_string(), &rest[2..]),
        _ => (String::new(), rest),
    };
    let resource = rest.first().copied().unwrap_or_default().to_string();
    let name = rest.get(1).copied().unwrap_or_default().to_string();
    let subresource = rest.get(2).copied().unwrap_or_default().to_string();

    let verb = match *method {
        Method::GET | Method::HEAD => {
            if watching {
                "watch"
            } else if name.is_empty() {
                "list"
            } else {
                "get"
            }
        }
        Method::POST => "create",
        Method::PUT => "update",
        Method::PATCH => "patch",
        Method::DELETE => {
            if name.is_empty() {
                "deletecollection"
            } else {
                "delete"
            }
        }
        _ => return RequestAttributes::NonResource {
            verb: method.as_str().to_lowercase(),
            path: path.to_string(),
        },
    }
    .to_string();

    RequestAttributes::Resource {
        verb,
        api_group,
        api_version,
        namespace,
        resource,
        subresource,
        name,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

/// The host framework's delegated authorizer.
#[async_trait::async_trait]
pub trait ProxyAuthorizer: Send + Sync {
    async fn authorize(&self, user: &UserIdentity, attributes: &RequestAttributes) -> Decision;
}

/// Stand-in used when no delegated authorizer is wired up.
pub struct AllowAll;

#[async_trait::async_trait]
impl ProxyAuthorizer for AllowAll {
    async fn authorize(&self, _user: &UserIdentity, _attributes: &RequestAttributes) -> Decision {
        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_group_resource() {
        let attrs = parse_attributes(&Method::GET, "/api/v1/namespaces/prod/pods/web-0", false);
        assert_eq!(
            attrs,
            RequestAttributes::Resource {
                verb: "get".into(),
                api_group: "".into(),
                api_version: "v1".into(),
                namespace: "prod".into(),
                resource: "pods".into(),
                subresource: "".into(),
                name: "web-0".into(),
            }
        );
    }

    #[test]
    fn parses_named_group_with_subresource() {
        let attrs = parse_attributes(
            &Method::POST,
            "/apis/apps/v1/namespaces/prod/deployments/web/scale",
            false,
        );
        let RequestAttributes::Resource {
            verb,
            api_group,
            resource,
            subresource,
            ..
        } = attrs
        else {
            panic!("expected resource attributes");
        };
        assert_eq!(verb, "create");
        assert_eq!(api_group, "apps");
        assert_eq!(resource, "deployments");
        assert_eq!(subresource, "scale");
    }

    #[test]
    fn list_get_and_watch_verbs() {
        let list = parse_attributes(&Method::GET, "/api/v1/pods", false);
        assert_eq!(list.verb(), "list");
        let get = parse_attributes(&Method::GET, "/api/v1/pods/x", false);
        assert_eq!(get.verb(), "get");
        let watch = parse_attributes(&Method::GET, "/api/v1/pods", true);
        assert_eq!(watch.verb(), "watch");
    }

    #[test]
    fn delete_collection() {
        let attrs = parse_attributes(&Method::DELETE, "/api/v1/namespaces/prod/pods", false);
        assert_eq!(attrs.verb(), "deletecollection");
        let attrs = parse_attributes(&Method::DELETE, "/api/v1/namespaces/prod/pods/x", false);
        assert_eq!(attrs.verb(), "delete");
    }

    #[test]
    fn non_resource_paths() {
        let attrs = parse_attributes(&Method::GET, "/healthz", false);
        assert_eq!(
            attrs,
            RequestAttributes::NonResource {
                verb: "get".into(),
                path: "/healthz".into(),
            }
        );
        assert_eq!(attrs.resource(), "");
    }
}
