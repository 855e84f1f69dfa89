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

//! Identity exchange: ordered rules rewriting the effective identity of a
//! proxied request.
//!
//! A rule matches only when every field present in its source matches the
//! caller and the target cluster. The first matching rule wins; a
//! per-cluster rule set, when present on the record, is consulted before
//! the global set.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::identity::{Impersonation, UserIdentity};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRule {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub source: Option<RuleSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RuleTarget>,
    /// Reserved for the external exchanger; carried but unused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// Project an empty impersonation: the target treats the caller as the
    /// gateway credential's own identity.
    #[serde(alias = "PrivilegedIdentityExchanger")]
    Privileged,
    /// Project the rule's configured target identity.
    #[serde(alias = "StaticMappingIdentityExchanger")]
    StaticMapping,
    /// Reserved; using it is an error until an external exchanger exists.
    #[serde(alias = "ExternalIdentityExchanger")]
    External,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_pattern: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub uid: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ExchangeError {
    #[error("rule {0}: the external identity exchanger is not implemented")]
    ExternalNotImplemented(String),
    #[error("reading identity rules: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing identity rules: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// The projection produced by a matching rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_name: String,
    pub impersonation: Impersonation,
}

/// Holds the global rule set; per-cluster overrides ride in on the access
/// record and are passed per call.
#[derive(Debug, Default)]
pub struct IdentityExchanger {
    global: Vec<IdentityRule>,
}

impl IdentityExchanger {
    pub fn new(global: Vec<IdentityRule>) -> Self {
        IdentityExchanger { global }
    }

    /// Load the global rule file. A missing configuration (no path) means
    /// an empty rule set; an unreadable or unparsable file is a startup
    /// error.
    pub fn from_file(path: &Path) -> Result<Self, ExchangeError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(IdentityExchanger::new(parse_rules_document(&raw)?))
    }

    /// First match from the per-cluster set, then the global set.
    pub fn exchange(
        &self,
        cluster_rules: Option<&[IdentityRule]>,
        user: &UserIdentity,
        cluster: &str,
    ) -> Result<Option<RuleMatch>, ExchangeError> {
        if let Some(rules) = cluster_rules {
            if let Some(m) = exchange(rules, user, cluster)? {
                return Ok(Some(m));
            }
        }
        exchange(&self.global, user, cluster)
    }
}

/// Apply an ordered rule list: the rule of lowest index among matches wins.
/// Unmatched input yields `Ok(None)`, never an error.
pub fn exchange(
    rules: &[IdentityRule],
    user: &UserIdentity,
    cluster: &str,
) -> Result<Option<RuleMatch>, ExchangeError> {
    for rule in rules {
        if !matches_source(rule.source.as_ref(), user, cluster) {
            continue;
        }
        let impersonation = match rule.rule_type {
            RuleType::Privileged => Impersonation::empty(),
            RuleType::StaticMapping => {
                let target = rule.target.clone().unwrap_or_default();
                Impersonation {
                    user: Some(target.user).filter(|u| !u.is_empty()),
                    groups: target.groups,
                    uid: Some(target.uid).filter(|u| !u.is_empty()),
                    extra: Default::default(),
                }
            }
            RuleType::External => {
                return Err(ExchangeError::ExternalNotImplemented(rule.name.clone()))
            }
        };
        return Ok(Some(RuleMatch {
            rule_name: rule.name.clone(),
            impersonation,
        }));
    }
    Ok(None)
}

fn matches_source(source: Option<&RuleSource>, user: &UserIdentity, cluster: &str) -> bool {
    let Some(source) = source else {
        // A rule without a source can never match.
        return false;
    };
    if let Some(name) = &source.user {
        if &user.name != name {
            return false;
        }
    }
    if let Some(group) = &source.group {
        if !user.groups.iter().any(|g| g == group) {
            return false;
        }
    }
    if let Some(uid) = &source.uid {
        if &user.uid != uid {
            return false;
        }
    }
    if let Some(name) = &source.cluster {
        if cluster != name {
            return false;
        }
    }
    if let Some(pattern) = &source.user_pattern {
        if !matches_pattern(pattern, &user.name) {
            return false;
        }
    }
    if let Some(pattern) = &source.group_pattern {
        if !user.groups.iter().any(|g| matches_pattern(pattern, g)) {
            return false;
        }
    }
    if let Some(pattern) = &source.cluster_pattern {
        if !matches_pattern(pattern, cluster) {
            return false;
        }
    }
    true
}

/// The pattern is used as written. An invalid pattern is a non-match for
/// its field; it never panics and never aborts the request.
fn matches_pattern(pattern: &str, query: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(query),
        Err(_) => false,
    }
}

/// YAML document shape shared by the global rule file and the per-cluster
/// record annotation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDocument {
    #[serde(default)]
    #[allow(dead_code)]
    api_version: String,
    #[serde(default)]
    #[allow(dead_code)]
    kind: String,
    spec: RuleDocumentSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDocumentSpec {
    client_identity_exchanger: ExchangerRules,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangerRules {
    #[serde(default)]
    rules: Vec<IdentityRule>,
}

pub fn parse_rules_document(yaml: &str) -> Result<Vec<IdentityRule>, serde_yaml::Error> {
    let doc: RuleDocument = serde_yaml::from_str(yaml)?;
    Ok(doc.spec.client_identity_exchanger.rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_rule(name: &str, source: RuleSource, target_user: &str) -> IdentityRule {
        IdentityRule {
            name: name.to_string(),
            rule_type: RuleType::StaticMapping,
            source: Some(source),
            target: Some(RuleTarget {
                user: target_user.to_string(),
                ..Default::default()
            }),
            url: None,
        }
    }

    #[test]
    fn per_cluster_rules_take_precedence() {
        let exchanger = IdentityExchanger::new(vec![static_rule(
            "global",
            RuleSource {
                user: Some("test".to_string()),
                ..Default::default()
            },
            "G",
        )]);
        let local = vec![static_rule(
            "local",
            RuleSource {
                group: Some("g".to_string()),
                ..Default::default()
            },
            "L",
        )];

        // both match: the per-cluster rule wins
        let user = UserIdentity::named("test").with_groups(&["g"]);
        let m = exchanger
            .exchange(Some(&local), &user, "c1")
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_name, "local");
        assert_eq!(m.impersonation.user.as_deref(), Some("L"));

        // only the global rule matches
        let user = UserIdentity::named("test").with_groups(&["x"]);
        let m = exchanger
            .exchange(Some(&local), &user, "c1")
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_name, "global");
        assert_eq!(m.impersonation.user.as_deref(), Some("G"));

        // nothing matches
        let user = UserIdentity::named("other");
        assert!(exchanger
            .exchange(Some(&local), &user, "c1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn lowest_index_wins() {
        let rules = vec![
            static_rule(
                "first",
                RuleSource {
                    user: Some("test".to_string()),
                    ..Default::default()
                },
                "A",
            ),
            static_rule(
                "second",
                RuleSource {
                    user: Some("test".to_string()),
                    ..Default::default()
                },
                "B",
            ),
        ];
        let m = exchange(&rules, &UserIdentity::named("test"), "c")
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_name, "first");
    }

    #[test]
    fn every_present_field_must_match() {
        let source = RuleSource {
            user: Some("test".to_string()),
            cluster: Some("prod".to_string()),
            ..Default::default()
        };
        let rules = vec![static_rule("both", source, "T")];
        let user = UserIdentity::named("test");
        assert!(exchange(&rules, &user, "prod").unwrap().is_some());
        assert!(exchange(&rules, &user, "staging").unwrap().is_none());
    }

    #[test]
    fn pattern_fields_match_as_written() {
        let rules = vec![static_rule(
            "pattern",
            RuleSource {
                user_pattern: Some("^system:serviceaccount:".to_string()),
                group_pattern: Some("admins$".to_string()),
                ..Default::default()
            },
            "T",
        )];
        let user = UserIdentity::named("system:serviceaccount:kube-system:builder")
            .with_groups(&["viewers", "cluster-admins"]);
        assert!(exchange(&rules, &user, "c").unwrap().is_some());

        let user = UserIdentity::named("alice").with_groups(&["cluster-admins"]);
        assert!(exchange(&rules, &user, "c").unwrap().is_none());
    }

    #[test]
    fn invalid_pattern_is_a_non_match() {
        let rules = vec![static_rule(
            "broken",
            RuleSource {
                user_pattern: Some("(unclosed".to_string()),
                ..Default::default()
            },
            "T",
        )];
        assert!(exchange(&rules, &UserIdentity::named("any"), "c")
            .unwrap()
            .is_none());
    }

    #[test]
    fn rule_without_source_never_matches() {
        let rules = vec![IdentityRule {
            name: "open".to_string(),
            rule_type: RuleType::Privileged,
            source: None,
            target: None,
            url: None,
        }];
        assert!(exchange(&rules, &UserIdentity::named("any"), "c")
            .unwrap()
            .is_none());
    }

    #[test]
    fn privileged_rule_projects_empty_impersonation() {
        let rules = vec![IdentityRule {
            name: "admin".to_string(),
            rule_type: RuleType::Privileged,
            source: Some(RuleSource {
                group: Some("gateway-admins".to_string()),
                ..Default::default()
            }),
            target: None,
            url: None,
        }];
        let user = UserIdentity::named("root").with_groups(&["gateway-admins"]);
        let m = exchange(&rules, &user, "c").unwrap().unwrap();
        assert!(m.impersonation.is_empty());
    }

    #[test]
    fn external_rule_is_an_error() {
        let rules = vec![IdentityRule {
            name: "ext".to_string(),
            rule_type: RuleType::External,
            source: Some(RuleSource {
                user: Some("test".to_string()),
                ..Default::default()
            }),
            target: None,
            url: Some("https://exchanger.example.com".to_string()),
        }];
        assert!(matches!(
            exchange(&rules, &UserIdentity::named("test"), "c"),
            Err(ExchangeError::ExternalNotImplemented(_))
        ));
    }

    #[test]
    fn parses_rule_document_with_long_type_names() {
        let yaml = concat!(
            "apiVersion: proxy.gateway.dev/v1alpha1\n",
            "kind: ClusterGatewayProxyConfiguration\n",
            "spec:\n",
            "  clientIdentityExchanger:\n",
            "    rules:\n",
            "    - name: mapped\n",
            "      type: StaticMappingIdentityExchanger\n",
            "      source:\n",
            "        userPattern: \"^ci-\"\n",
            "      target:\n",
            "        user: ci-bot\n",
            "        groups: [bots]\n",
        );
        let rules = parse_rules_document(yaml).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_type, RuleType::StaticMapping);
        assert_eq!(
            rules[0].source.as_ref().unwrap().user_pattern.as_deref(),
            Some("^ci-")
        );
    }
}
