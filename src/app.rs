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

//! Process wiring: build every component from the configuration and drive
//! the front-door accept loop.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::access::{AccessStore, RecordKeys};
use crate::authz::{AllowAll, ProxyAuthorizer};
use crate::config::{Config, SecretSource};
use crate::credential::{CredentialCache, ExecIssuer};
use crate::exchange::IdentityExchanger;
use crate::metrics::server::AdminServer;
use crate::metrics::Metrics;
use crate::proxy::{
    full_body, parse_route, BoxBody, ProxyHandler, ProxyOptions, RequestEscaper, Responder,
    StatusResponder,
};
use crate::secrets::{ClusterRegistry, DirSecretStore, SecretStore};
use crate::signal::Shutdown;
use crate::transport::TransportBuilder;
use crate::tunnel::TunnelDialer;

/// Assembles an [`App`]. Embedders (the host framework) inject their own
/// secret store, cluster registry, authorizer or responder here; the
/// stand-alone binary relies on the directory-backed defaults.
pub struct AppBuilder {
    cfg: Config,
    secrets: Option<Arc<dyn SecretStore>>,
    registry: Option<Arc<dyn ClusterRegistry>>,
    authorizer: Option<Arc<dyn ProxyAuthorizer>>,
    responder: Option<Arc<dyn Responder>>,
}

impl AppBuilder {
    pub fn new(cfg: Config) -> Self {
        AppBuilder {
            cfg,
            secrets: None,
            registry: None,
            authorizer: None,
            responder: None,
        }
    }

    pub fn with_secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_cluster_registry(mut self, registry: Arc<dyn ClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn ProxyAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn build(self) -> anyhow::Result<App> {
        let cfg = self.cfg;

        let secrets: Arc<dyn SecretStore> = match self.secrets {
            Some(secrets) => secrets,
            None => match &cfg.secret_source {
                SecretSource::Directory(dir) => DirSecretStore::new(dir.clone()),
                SecretSource::Namespace(ns) => anyhow::bail!(
                    "namespace-backed records ({ns}) are served by the hosting control plane; \
                     embed the gateway with AppBuilder::with_secret_store, or use --secret-dir"
                ),
            },
        };

        let exchanger = match &cfg.identity_rules {
            Some(path) => IdentityExchanger::from_file(path)
                .with_context(|| format!("loading identity rules from {}", path.display()))?,
            None => IdentityExchanger::default(),
        };

        let tunnel = cfg.cluster_proxy.clone().map(TunnelDialer::new);
        if tunnel.is_none() {
            debug!("no cluster proxy configured; tunnelled egress disabled");
        }

        let authorizer = if cfg.authorize_proxy_subpath {
            Some(self.authorizer.unwrap_or_else(|| {
                warn!("proxy subpath authorization enabled without a delegated authorizer; allowing all");
                Arc::new(AllowAll)
            }))
        } else {
            None
        };

        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::new(&mut registry));

        let access = Arc::new(AccessStore::new(
            secrets,
            self.registry,
            RecordKeys::from_config(&cfg),
            cfg.features,
        ));
        let transports = Arc::new(TransportBuilder::new(
            Arc::new(CredentialCache::new(Arc::new(ExecIssuer::new()))),
            tunnel,
        ));
        let handler = Arc::new(ProxyHandler::new(
            access,
            transports,
            Arc::new(exchanger),
            authorizer,
            self.responder.unwrap_or_else(|| Arc::new(StatusResponder)),
            metrics,
            cfg.features,
        ));
        let router = Arc::new(Router {
            escaper: RequestEscaper::new(&cfg.api_group, &cfg.api_version),
            api_group: cfg.api_group.clone(),
            api_version: cfg.api_version.clone(),
            handler,
        });
        Ok(App {
            cfg,
            router,
            registry: Arc::new(registry),
        })
    }
}

pub struct App {
    cfg: Config,
    router: Arc<Router>,
    registry: Arc<Registry>,
}

impl App {
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.cfg.bind)
            .await
            .with_context(|| format!("binding front door to {}", self.cfg.bind))?;
        info!(addr = %self.cfg.bind, "gateway front door listening");

        let admin = AdminServer::new(self.cfg.admin_bind, self.registry.clone());
        tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!("admin endpoint failed: {e}");
            }
        });

        let mut shutdown_wait = std::pin::pin!(shutdown.wait());
        loop {
            tokio::select! {
                _ = &mut shutdown_wait => {
                    info!("gateway shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accepting connection")?;
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let router = router.clone();
                            async move { router.route(req).await }
                        });
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            debug!(%peer, "connection ended: {e}");
                        }
                    });
                }
            }
        }
    }

    /// The port-bound address is only known after `run` starts; tests bind
    /// their own listener and drive [`Router::route`] directly instead.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }
}

/// The front door: resolves each request to the proxy subresource or a
/// terminal 404.
pub struct Router {
    escaper: RequestEscaper,
    api_group: String,
    api_version: String,
    handler: Arc<ProxyHandler>,
}

impl Router {
    pub async fn route(&self, req: Request<Incoming>) -> Result<Response<BoxBody>, Infallible> {
        let mut req = req.map(|body| body.boxed_unsync());
        let route = parse_route(req.uri().path(), &self.api_group, &self.api_version);
        let Some(route) = route else {
            return Ok(not_found(req.uri().path()));
        };
        // Options come from the original query; the escaper then rewrites
        // the request the handler forwards.
        let options = ProxyOptions::from_query(req.uri().query().unwrap_or(""));
        self.escaper.apply(&mut req);
        Ok(self.handler.serve(route, options, req).await)
    }
}

fn not_found(path: &str) -> Response<BoxBody> {
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("the server could not find the requested resource {path:?}"),
        "code": 404,
    });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("static response")
}
