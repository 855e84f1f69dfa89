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

//! The admin endpoint: Prometheus metrics and liveness.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct AdminServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
}

impl AdminServer {
    pub fn new(addr: SocketAddr, registry: Arc<Registry>) -> Self {
        AdminServer { addr, registry }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "admin endpoint listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let registry = self.registry.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, registry.clone()));
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    warn!("admin connection error: {e}");
                }
            });
        }
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    registry: Arc<Registry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" | "/stats/prometheus" => {
            let mut body = String::new();
            match encode(&mut body, &registry) {
                Ok(()) => Response::builder()
                    .status(StatusCode::OK)
                    .header(
                        hyper::header::CONTENT_TYPE,
                        "application/openmetrics-text;charset=utf-8;version=1.0.0",
                    )
                    .body(Full::new(Bytes::from(body)))
                    .expect("static response"),
                Err(e) => plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("encoding metrics: {e}"),
                ),
            }
        }
        "/healthz" => plain_response(StatusCode::OK, "ok".to_string()),
        _ => plain_response(StatusCode::NOT_FOUND, "not found".to_string()),
    };
    Ok(response)
}

fn plain_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}
