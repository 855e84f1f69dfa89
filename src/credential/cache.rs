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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{CredentialIssuer, ExecSpec, IssueError, IssuedCredential};

/// A cached credential is served only while it has at least this long left
/// before expiry.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedCredential {
    credential: IssuedCredential,
    expires_at: chrono::DateTime<Utc>,
}

/// Process-local memoisation of issued credentials, keyed by cluster name.
///
/// The lock is never held across an issuance, so concurrent misses for the
/// same cluster may each run the external command; the last write wins and
/// redundant invocations are benign.
pub struct CredentialCache {
    issuer: Arc<dyn CredentialIssuer>,
    entries: RwLock<HashMap<String, CachedCredential>>,
}

impl CredentialCache {
    pub fn new(issuer: Arc<dyn CredentialIssuer>) -> Self {
        CredentialCache {
            issuer,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        cluster: &str,
        spec: &ExecSpec,
    ) -> Result<IssuedCredential, IssueError> {
        let margin = chrono::Duration::from_std(EXPIRY_MARGIN).expect("margin fits");
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(cluster) {
                if Utc::now() + margin < entry.expires_at {
                    return Ok(entry.credential.clone());
                }
            }
        }

        let credential = self.issuer.issue(spec).await?;
        match credential.expires_at {
            // Entries without an expiry are never cached, and an expiry
            // already in the past is discarded without caching.
            Some(expires_at) if expires_at > Utc::now() => {
                debug!(cluster, %expires_at, "caching issued credential");
                self.entries.write().await.insert(
                    cluster.to_string(),
                    CachedCredential {
                        credential: credential.clone(),
                        expires_at,
                    },
                );
            }
            _ => {}
        }
        Ok(credential)
    }
}
