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

use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const DURATION_BUCKETS: [f64; 12] = [
    0.0, 0.005, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub resource: String,
    pub verb: String,
    pub code: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
    pub code: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub resource: String,
    pub verb: String,
    pub cluster: String,
    pub code: u16,
}

fn duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

pub struct Metrics {
    by_resource: Family<ResourceLabels, Counter>,
    by_cluster: Family<ClusterLabels, Counter>,
    duration: Family<DurationLabels, Histogram>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let by_resource = Family::<ResourceLabels, Counter>::default();
        registry.register(
            "proxied_requests_by_resource",
            "Number of proxied requests by target resource",
            by_resource.clone(),
        );
        let by_cluster = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "proxied_requests_by_cluster",
            "Number of proxied requests by target cluster",
            by_cluster.clone(),
        );
        let duration = Family::<DurationLabels, Histogram>::new_with_constructor(
            duration_histogram as fn() -> Histogram,
        );
        registry.register(
            "proxied_request_duration_seconds",
            "Proxied request time cost",
            duration.clone(),
        );
        Self {
            by_resource,
            by_cluster,
            duration,
        }
    }

    /// Record one finished (or failed) proxied request.
    pub fn observe(
        &self,
        resource: &str,
        verb: &str,
        cluster: &str,
        code: u16,
        duration: Duration,
    ) {
        self.by_resource
            .get_or_create(&ResourceLabels {
                resource: resource.to_string(),
                verb: verb.to_string(),
                code,
            })
            .inc();
        self.by_cluster
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
                code,
            })
            .inc();
        self.duration
            .get_or_create(&DurationLabels {
                resource: resource.to_string(),
                verb: verb.to_string(),
                cluster: cluster.to_string(),
                code,
            })
            .observe(duration.as_secs_f64());
    }
}
