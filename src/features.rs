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

//! Feature gates controlling optional behavior of the request plane.

/// The set of recognised feature gates with their current state.
///
/// Defaults mirror the maturity of each feature: both gates below are off
/// until the surrounding controllers (health checking, identity
/// penetration policy) are deployed alongside the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSet {
    /// Refuse proxying to clusters whose records are marked unhealthy.
    pub healthiness_check: bool,
    /// Rewrite the effective identity of proxied requests via the
    /// identity exchanger rules.
    pub client_identity_penetration: bool,
}

impl Default for FeatureSet {
    fn default() -> Self {
        FeatureSet {
            healthiness_check: false,
            client_identity_penetration: false,
        }
    }
}

impl FeatureSet {
    /// Parse a "Gate=bool,Gate=bool" list. Unknown gates and malformed
    /// entries are rejected; the offending fragment is returned.
    pub fn parse(s: &str) -> Result<FeatureSet, String> {
        let mut set = FeatureSet::default();
        for frag in s.split(',') {
            let frag = frag.trim();
            if frag.is_empty() {
                continue;
            }
            let (name, value) = frag.split_once('=').ok_or_else(|| frag.to_string())?;
            let value: bool = value.trim().parse().map_err(|_| frag.to_string())?;
            match name.trim() {
                "HealthinessCheck" => set.healthiness_check = value,
                "ClientIdentityPenetration" => set.client_identity_penetration = value,
                _ => return Err(frag.to_string()),
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_gates() {
        let set = FeatureSet::parse("HealthinessCheck=true,ClientIdentityPenetration=false")
            .expect("valid gates");
        assert!(set.healthiness_check);
        assert!(!set.client_identity_penetration);
    }

    #[test]
    fn empty_input_yields_defaults() {
        assert_eq!(FeatureSet::parse("").unwrap(), FeatureSet::default());
    }

    #[test]
    fn rejects_unknown_gate() {
        assert_eq!(
            FeatureSet::parse("NoSuchGate=true"),
            Err("NoSuchGate=true".to_string())
        );
    }

    #[test]
    fn rejects_malformed_fragment() {
        assert!(FeatureSet::parse("HealthinessCheck").is_err());
        assert!(FeatureSet::parse("HealthinessCheck=yes").is_err());
    }
}
