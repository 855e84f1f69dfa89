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

//! Protocol-upgrade splicing (WebSocket, SPDY).
//!
//! Once both handshakes complete, the client and upstream connections are
//! reduced to raw byte streams and pumped in both directions. The pumps
//! share one future: either side ending (or the request being dropped)
//! tears down the other.

use http::header::{HeaderMap, CONNECTION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, trace};

/// An upgrade requires both a `Connection: Upgrade` option and an
/// `Upgrade` header naming the protocol.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|option| option.trim().eq_ignore_ascii_case("upgrade"));
    wants_upgrade && headers.contains_key(UPGRADE)
}

/// Drive both upgraded connections until either closes. Spawned once the
/// 101 response has been returned to the client.
pub async fn splice(cluster: String, client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(cluster, "upgrade handshake did not complete: {e}");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            trace!(cluster, to_upstream, to_client, "upgraded connection finished");
        }
        Err(e) => debug!(cluster, "upgraded connection aborted: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn detects_upgrade_requests() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));

        headers.insert(
            CONNECTION,
            HeaderValue::from_static("keep-alive, Upgrade"),
        );
        assert!(is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!is_upgrade_request(&headers));
    }
}
