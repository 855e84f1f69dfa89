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

use std::sync::Arc;
use std::time::Instant;

use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use http::{Request, Response, StatusCode, Uri};
use tracing::{debug, warn};

use super::upgrade;
use super::{empty_body, join_paths, BoxBody, Error, ProxyOptions, ProxyRoute, Responder};
use crate::access::{AccessStore, ClusterAccess};
use crate::authz::{parse_attributes, Decision, ProxyAuthorizer, RequestAttributes};
use crate::exchange::IdentityExchanger;
use crate::features::FeatureSet;
use crate::identity::{Impersonation, UserIdentity};
use crate::metrics::Metrics;
use crate::transport::TransportBuilder;

/// The per-request proxy. Holds only shared, immutable collaborators;
/// every request builds its own access record and transport, so concurrent
/// requests share no mutable state here.
pub struct ProxyHandler {
    access: Arc<AccessStore>,
    transports: Arc<TransportBuilder>,
    exchanger: Arc<IdentityExchanger>,
    authorizer: Option<Arc<dyn ProxyAuthorizer>>,
    responder: Arc<dyn Responder>,
    metrics: Arc<Metrics>,
    features: FeatureSet,
}

impl ProxyHandler {
    pub fn new(
        access: Arc<AccessStore>,
        transports: Arc<TransportBuilder>,
        exchanger: Arc<IdentityExchanger>,
        authorizer: Option<Arc<dyn ProxyAuthorizer>>,
        responder: Arc<dyn Responder>,
        metrics: Arc<Metrics>,
        features: FeatureSet,
    ) -> Self {
        ProxyHandler {
            access,
            transports,
            exchanger,
            authorizer,
            responder,
            metrics,
            features,
        }
    }

    /// Serve one proxied request: terminal errors go through the responder
    /// (exactly once), and the outcome is recorded either way.
    pub async fn serve(
        &self,
        route: ProxyRoute,
        options: ProxyOptions,
        req: Request<BoxBody>,
    ) -> Response<BoxBody> {
        let start = Instant::now();
        let target_path = join_paths(&[&options.path, &route.remainder]);
        let attributes = parse_attributes(req.method(), &target_path, options.watch);
        let response = match self
            .handle(&route, &options, &target_path, &attributes, req)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(cluster = %route.cluster, "proxy error: {e}");
                self.responder.error(&e)
            }
        };
        self.metrics.proxy.observe(
            attributes.resource(),
            attributes.verb(),
            &route.cluster,
            response.status().as_u16(),
            start.elapsed(),
        );
        response
    }

    async fn handle(
        &self,
        route: &ProxyRoute,
        options: &ProxyOptions,
        target_path: &str,
        attributes: &RequestAttributes,
        req: Request<BoxBody>,
    ) -> Result<Response<BoxBody>, Error> {
        let access = self.access.get(&route.cluster).await?;

        if self.features.healthiness_check && !access.health.allows_proxy() {
            return Err(Error::Unhealthy {
                cluster: access.name.clone(),
                reason: access.health.reason.clone(),
            });
        }

        let user = UserIdentity::from_headers(req.headers());

        if let Some(authorizer) = &self.authorizer {
            let caller = user.clone().unwrap_or_else(anonymous_user);
            if let Decision::Deny(reason) = authorizer.authorize(&caller, attributes).await {
                return Err(Error::Forbidden(reason));
            }
        }

        let impersonation = match (&user, options.impersonate) {
            (Some(user), true) if self.features.client_identity_penetration => {
                Some(self.project_identity(&access, user, &route.cluster))
            }
            _ => None,
        };

        let mut transport = self.transports.build(&access).await.map_err(|e| {
            warn!(cluster = %access.name, "building transport: {e}");
            Error::BadCredential(access.name.clone())
        })?;
        transport.impersonation = impersonation;

        self.forward(&access.name, transport, target_path, options, req)
            .await
    }

    /// Run the identity exchanger; a rule match projects its directive,
    /// anything else echoes the caller's own identity.
    fn project_identity(
        &self,
        access: &ClusterAccess,
        user: &UserIdentity,
        cluster: &str,
    ) -> Impersonation {
        match self
            .exchanger
            .exchange(access.proxy_rules.as_deref(), user, cluster)
        {
            Ok(Some(matched)) => {
                debug!(cluster, rule = %matched.rule_name, "identity rule matched");
                matched.impersonation
            }
            Ok(None) => user.as_impersonation(),
            Err(e) => {
                warn!(cluster, "identity exchange failed, echoing caller: {e}");
                user.as_impersonation()
            }
        }
    }

    async fn forward(
        &self,
        cluster: &str,
        transport: crate::transport::TransportConfig,
        target_path: &str,
        options: &ProxyOptions,
        mut req: Request<BoxBody>,
    ) -> Result<Response<BoxBody>, Error> {
        let upgrading = upgrade::is_upgrade_request(req.headers());
        let client_upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));

        let upstream_path = join_paths(&[&transport.base_path(), target_path]);
        let path_and_query = match req.uri().query() {
            Some(query) if !query.is_empty() => format!("{upstream_path}?{query}"),
            _ => upstream_path,
        };
        let uri: Uri = path_and_query
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid upstream path {path_and_query:?}")))?;

        let (parts, body) = req.into_parts();
        let mut upstream_req = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)
            .expect("request from parsed parts");
        *upstream_req.headers_mut() = forwarded_headers(&parts.headers, upgrading);

        let headers = upstream_req.headers_mut();
        headers.insert(
            HOST,
            HeaderValue::from_str(transport.host_header())
                .map_err(|_| Error::BadRequest("invalid upstream host".to_string()))?,
        );
        if let Some(token) = &transport.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::BadCredential(cluster.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(impersonation) = &transport.impersonation {
            impersonation.apply(headers);
        }

        let upstream_error = |detail: String| Error::Upstream {
            cluster: cluster.to_string(),
            detail,
        };
        let exchange = async {
            let mut sender = transport
                .connect::<BoxBody>()
                .await
                .map_err(|e| upstream_error(e.to_string()))?;
            sender
                .send_request(upstream_req)
                .await
                .map_err(|e| upstream_error(e.to_string()))
        };

        // Upgrades and watches outlive the transport timeout; they end
        // only with the request itself.
        let long_running = upgrading || options.watch;
        let mut response = if long_running {
            exchange.await?
        } else {
            match tokio::time::timeout(transport.timeout, exchange).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::Timeout {
                        cluster: cluster.to_string(),
                        timeout: transport.timeout,
                    })
                }
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(client_upgrade) = client_upgrade else {
                return Err(upstream_error(
                    "unexpected 101 response to a non-upgrade request".to_string(),
                ));
            };
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(upgrade::splice(
                cluster.to_string(),
                client_upgrade,
                upstream_upgrade,
            ));
            let (parts, _) = response.into_parts();
            return Ok(Response::from_parts(parts, empty_body()));
        }

        Ok(response.map(BoxBody::new))
    }
}

fn anonymous_user() -> UserIdentity {
    UserIdentity::named("system:anonymous").with_groups(&["system:unauthenticated"])
}

/// Copy end-to-end headers. Hop-by-hop headers, the caller's own
/// authorization, the authenticating-proxy attestations, and any smuggled
/// impersonation directives never cross the gateway.
fn forwarded_headers(headers: &HeaderMap, upgrading: bool) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let skipped = matches!(
            name.as_str(),
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "proxy-connection"
                | "te"
                | "trailer"
                | "transfer-encoding"
                | "upgrade"
                | "host"
                | "authorization"
        );
        if skipped
            || name.as_str().starts_with("x-remote-")
            || name.as_str().starts_with("impersonate-")
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if upgrading {
        if let Some(protocol) = headers.get(UPGRADE) {
            out.insert(UPGRADE, protocol.clone());
            out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        }
    }
    out
}
