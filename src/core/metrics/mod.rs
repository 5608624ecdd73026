//! The metric facade: typed, cheaply-cloneable handles that enqueue samples
//! for the background [`sender::MetricSender`] rather than maintaining a
//! local Prometheus registry. Grounded on
//! `original_source/erddaputil/main/metrics.py` (`ScriptMetrics`,
//! `_Script*Metric` classes).

pub mod sender;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

pub use sender::{MetricSample, MetricSender, MetricSenderConfig};

/// Cache key mirrors the original's `ClassName__name__label_key` scheme so
/// repeated lookups of the same metric+label combination return the same
/// handle instead of allocating a fresh one.
fn cache_key(kind: &str, name: &str, labels: &BTreeMap<String, String>) -> String {
    let mut key = format!("{kind}__{name}");
    for (k, v) in labels {
        key.push_str("__");
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

struct Inner {
    tx: mpsc::Sender<MetricSample>,
    cache: DashMap<String, ()>,
}

/// Shared handle passed to every component that reports metrics. Cheap to
/// clone (`Arc` internally); `halt()` should be called exactly once, last,
/// during daemon shutdown.
#[derive(Clone)]
pub struct MetricFacade {
    inner: Arc<Inner>,
}

impl MetricFacade {
    /// `tx` is the sending half of the channel the [`MetricSender`]
    /// background task drains; `capacity` bounds how many samples may be
    /// in flight before `.send()` backpressures the caller.
    pub fn new(tx: mpsc::Sender<MetricSample>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tx,
                cache: DashMap::new(),
            }),
        }
    }

    pub fn counter(&self, name: impl Into<String>, description: impl Into<String>) -> CounterMetric {
        self.handle("counter", name, description, BTreeMap::new())
    }

    pub fn gauge(&self, name: impl Into<String>, description: impl Into<String>) -> GaugeMetric {
        self.handle("gauge", name, description, BTreeMap::new())
    }

    pub fn summary(&self, name: impl Into<String>, description: impl Into<String>) -> SummaryMetric {
        self.handle("summary", name, description, BTreeMap::new())
    }

    pub fn histogram(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        buckets: Vec<f64>,
    ) -> HistogramMetric {
        HistogramMetric {
            base: self.handle("histogram", name, description, BTreeMap::new()),
            buckets,
        }
    }

    pub fn info(&self, name: impl Into<String>, description: impl Into<String>) -> InfoMetric {
        self.handle("info", name, description, BTreeMap::new())
    }

    pub fn enum_metric(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        states: Vec<String>,
    ) -> EnumMetric {
        EnumMetric {
            base: self.handle("enum", name, description, BTreeMap::new()),
            states,
        }
    }

    fn handle<M: MetricKindMarker>(
        &self,
        kind: &'static str,
        name: impl Into<String>,
        description: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> M {
        let name = name.into();
        let key = cache_key(kind, &name, &labels);
        self.inner.cache.entry(key).or_insert(());
        M::from_parts(self.inner.tx.clone(), kind, name, description.into(), labels)
    }

}

trait MetricKindMarker {
    fn from_parts(
        tx: mpsc::Sender<MetricSample>,
        kind: &'static str,
        name: String,
        description: String,
        labels: BTreeMap<String, String>,
    ) -> Self;
}

macro_rules! metric_handle {
    ($name:ident) => {
        #[derive(Clone)]
        pub struct $name {
            tx: mpsc::Sender<MetricSample>,
            kind: &'static str,
            name: String,
            description: String,
            labels: BTreeMap<String, String>,
        }

        impl MetricKindMarker for $name {
            fn from_parts(
                tx: mpsc::Sender<MetricSample>,
                kind: &'static str,
                name: String,
                description: String,
                labels: BTreeMap<String, String>,
            ) -> Self {
                Self {
                    tx,
                    kind,
                    name,
                    description,
                    labels,
                }
            }
        }

        impl $name {
            fn emit(&self, method: &'static str, arguments: serde_json::Value) {
                let sample = MetricSample {
                    metric_type: self.kind,
                    metric_name: self.name.clone(),
                    labels: self.labels.clone(),
                    description: self.description.clone(),
                    method,
                    arguments,
                };
                if let Err(e) = self.tx.try_send(sample) {
                    tracing::debug!(error = %e, "dropping metric sample, channel full or closed");
                }
            }
        }
    };
}

metric_handle!(CounterMetric);
impl CounterMetric {
    pub fn inc(&self, amount: f64) {
        self.emit("inc", serde_json::json!({"amount": amount}));
    }
}

metric_handle!(GaugeMetric);
impl GaugeMetric {
    pub fn inc(&self, amount: f64) {
        self.emit("inc", serde_json::json!({"amount": amount}));
    }
    pub fn dec(&self, amount: f64) {
        self.emit("dec", serde_json::json!({"amount": amount}));
    }
    pub fn set(&self, value: f64) {
        self.emit("set", serde_json::json!({"value": value}));
    }
}

metric_handle!(SummaryMetric);
impl SummaryMetric {
    pub fn observe(&self, value: f64) {
        self.emit("observe", serde_json::json!({"value": value}));
    }
}

metric_handle!(InfoMetric);
impl InfoMetric {
    pub fn info(&self, values: BTreeMap<String, String>) {
        self.emit("info", serde_json::json!({"values": values}));
    }
}

metric_handle!(HistogramMetricBase);

#[derive(Clone)]
pub struct HistogramMetric {
    base: HistogramMetricBase,
    buckets: Vec<f64>,
}

impl HistogramMetric {
    pub fn observe(&self, value: f64) {
        self.base.emit(
            "observe",
            serde_json::json!({"value": value, "buckets": self.buckets}),
        );
    }
}

#[derive(Clone)]
pub struct EnumMetric {
    base: EnumMetricBase,
    states: Vec<String>,
}

metric_handle!(EnumMetricBase);

impl EnumMetric {
    pub fn state(&self, value: &str) -> Result<(), crate::core::errors::CoreError> {
        if !self.states.contains(&value.to_string()) {
            return Err(crate::core::errors::CoreError::validation(format!(
                "'{value}' is not one of the declared enum states"
            )));
        }
        self.base
            .emit("state", serde_json::json!({"value": value, "states": self.states}));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_enqueues_a_sample() {
        let (tx, mut rx) = mpsc::channel(8);
        let facade = MetricFacade::new(tx);
        let counter = facade.counter("commands_routed", "number of commands routed");
        counter.inc(1.0);
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.metric_type, "counter");
        assert_eq!(sample.metric_name, "commands_routed");
        assert_eq!(sample.method, "inc");
    }

    #[tokio::test]
    async fn enum_metric_rejects_unknown_state() {
        let (tx, _rx) = mpsc::channel(8);
        let facade = MetricFacade::new(tx);
        let e = facade.enum_metric("supervisor_state", "worker state", vec!["up".into(), "down".into()]);
        assert!(e.state("sideways").is_err());
        assert!(e.state("up").is_ok());
    }
}
