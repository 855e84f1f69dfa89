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

use std::env;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Install the global tracing subscriber. `RUST_LOG` selects levels
/// (default `info`), `LOG_FORMAT=json` switches to structured output.
pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        registry
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Like [`setup_logging`], but safe to call repeatedly from tests.
#[cfg(any(test, feature = "testing"))]
pub fn setup_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
