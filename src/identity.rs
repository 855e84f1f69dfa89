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

//! Caller identity and impersonation.
//!
//! The gateway does not authenticate end users itself; the host framework
//! does and forwards the result using the authenticating-proxy header
//! convention. On the way out, an impersonation directive becomes the
//! `Impersonate-*` headers understood by the target apiserver.

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};

const REMOTE_USER: &str = "x-remote-user";
const REMOTE_GROUP: &str = "x-remote-group";
const REMOTE_UID: &str = "x-remote-uid";
const REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_UID: &str = "impersonate-uid";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// The authenticated caller, as attested by the host framework.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub groups: Vec<String>,
    pub uid: String,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserIdentity {
    pub fn named(name: impl Into<String>) -> Self {
        UserIdentity {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Extract the caller from authenticating-proxy headers. Returns None
    /// when no user header is present (an unauthenticated request).
    pub fn from_headers(headers: &HeaderMap) -> Option<UserIdentity> {
        let name = headers.get(REMOTE_USER)?.to_str().ok()?.to_string();
        let groups = headers
            .get_all(REMOTE_GROUP)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let uid = headers
            .get(REMOTE_UID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in headers.iter() {
            let key = key.as_str();
            if let Some(suffix) = key.strip_prefix(REMOTE_EXTRA_PREFIX) {
                if let Ok(value) = value.to_str() {
                    extra
                        .entry(suffix.to_string())
                        .or_default()
                        .push(value.to_string());
                }
            }
        }
        Some(UserIdentity {
            name,
            groups,
            uid,
            extra,
        })
    }

    /// The impersonation directive echoing the caller's own identity, used
    /// when no exchanger rule matches.
    pub fn as_impersonation(&self) -> Impersonation {
        Impersonation {
            user: Some(self.name.clone()),
            groups: self.groups.clone(),
            uid: None,
            extra: self.extra.clone(),
        }
    }
}

/// An instruction for the target apiserver to treat the caller as a
/// different identity. An empty directive adds no headers, so the target
/// sees the gateway credential's own identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Impersonation {
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub uid: Option<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Impersonation {
    pub fn empty() -> Self {
        Impersonation::default()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.groups.is_empty() && self.uid.is_none() && self.extra.is_empty()
    }

    /// Write the directive onto an upstream request's headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(user) = &self.user {
            if let Ok(v) = HeaderValue::from_str(user) {
                headers.insert(HeaderName::from_static(IMPERSONATE_USER), v);
            }
        }
        for group in &self.groups {
            if let Ok(v) = HeaderValue::from_str(group) {
                headers.append(HeaderName::from_static(IMPERSONATE_GROUP), v);
            }
        }
        if let Some(uid) = &self.uid {
            if let Ok(v) = HeaderValue::from_str(uid) {
                headers.insert(HeaderName::from_static(IMPERSONATE_UID), v);
            }
        }
        for (key, values) in &self.extra {
            let Ok(name) = HeaderName::try_from(format!("{IMPERSONATE_EXTRA_PREFIX}{key}")) else {
                continue;
            };
            for value in values {
                if let Ok(v) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_identity_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(REMOTE_USER, HeaderValue::from_static("alice"));
        headers.append(REMOTE_GROUP, HeaderValue::from_static("dev"));
        headers.append(REMOTE_GROUP, HeaderValue::from_static("ops"));
        headers.insert(REMOTE_UID, HeaderValue::from_static("u-1"));
        headers.insert(
            "x-remote-extra-scopes",
            HeaderValue::from_static("read-only"),
        );
        let user = UserIdentity::from_headers(&headers).unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.groups, vec!["dev", "ops"]);
        assert_eq!(user.uid, "u-1");
        assert_eq!(user.extra.get("scopes").unwrap(), &vec!["read-only"]);
    }

    #[test]
    fn absent_user_header_is_anonymous() {
        assert_eq!(UserIdentity::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn impersonation_headers_round_out() {
        let imp = Impersonation {
            user: Some("target".to_string()),
            groups: vec!["g1".to_string(), "g2".to_string()],
            uid: Some("u-2".to_string()),
            extra: BTreeMap::from([("scopes".to_string(), vec!["admin".to_string()])]),
        };
        let mut headers = HeaderMap::new();
        imp.apply(&mut headers);
        assert_eq!(headers.get(IMPERSONATE_USER).unwrap(), "target");
        let groups: Vec<_> = headers.get_all(IMPERSONATE_GROUP).iter().collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(headers.get(IMPERSONATE_UID).unwrap(), "u-2");
        assert_eq!(headers.get("impersonate-extra-scopes").unwrap(), "admin");
    }

    #[test]
    fn empty_impersonation_adds_nothing() {
        let mut headers = HeaderMap::new();
        Impersonation::empty().apply(&mut headers);
        assert!(headers.is_empty());
    }
}
