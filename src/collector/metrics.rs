use crate::runner::MeasurementResult;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::sync::{RwLock, RwLockReadGuard};

type FloatGauge = Gauge<f64, AtomicU64>;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabels {
    pub host: String,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl EncodeLabelValue for Outcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

/// How `internet_latency_ms` is labelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyLabels {
    /// One series per measured host (discovery mode).
    PerHost,
    /// A single unlabelled series (fixed server mode).
    None,
}

#[derive(Clone, Debug)]
enum LatencyGauge {
    PerHost(Family<HostLabels, FloatGauge>),
    Single(FloatGauge),
}

/// Gauges holding the last completed measurement.
///
/// `record` writes all fields under one write lock and [`SpeedMetrics::read`]
/// hands out the matching read lock for rendering, so a scrape never sees
/// download, upload and latency from different cycles.
#[derive(Debug)]
pub struct SpeedMetrics {
    download: FloatGauge,
    upload: FloatGauge,
    latency: LatencyGauge,
    cycles: Family<OutcomeLabels, Counter>,
    update: RwLock<()>,
}

impl SpeedMetrics {
    pub fn new(labels: LatencyLabels) -> Self {
        let latency = match labels {
            LatencyLabels::PerHost => LatencyGauge::PerHost(Family::default()),
            LatencyLabels::None => LatencyGauge::Single(FloatGauge::default()),
        };
        Self {
            download: FloatGauge::default(),
            upload: FloatGauge::default(),
            latency,
            cycles: Family::default(),
            update: RwLock::new(()),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "internet_download_speed_mbps",
            "Current Internet download speed in Mbps",
            self.download.clone(),
        );
        registry.register(
            "internet_upload_speed_mbps",
            "Current Internet upload speed in Mbps",
            self.upload.clone(),
        );
        match &self.latency {
            LatencyGauge::PerHost(family) => registry.register(
                "internet_latency_ms",
                "Current Internet latency in milliseconds",
                family.clone(),
            ),
            LatencyGauge::Single(gauge) => registry.register(
                "internet_latency_ms",
                "Current Internet latency in milliseconds",
                gauge.clone(),
            ),
        }
        registry.register(
            "internet_speedtest_cycles",
            "Speed test cycles by outcome",
            self.cycles.clone(),
        );
    }

    pub fn set_download(&self, mbps: f64) {
        self.download.set(mbps);
    }

    pub fn set_upload(&self, mbps: f64) {
        self.upload.set(mbps);
    }

    /// `host` is ignored when latency is unlabelled.
    pub fn set_latency(&self, ms: f64, host: &str) {
        match &self.latency {
            LatencyGauge::PerHost(family) => {
                family
                    .get_or_create(&HostLabels {
                        host: host.to_string(),
                    })
                    .set(ms);
            }
            LatencyGauge::Single(gauge) => {
                gauge.set(ms);
            }
        }
    }

    pub fn record(&self, result: &MeasurementResult) {
        let _guard = self.update.write().unwrap();
        self.set_download(result.download_mbps);
        self.set_upload(result.upload_mbps);
        self.set_latency(result.latency_ms(), &result.host);
        self.cycles
            .get_or_create(&OutcomeLabels {
                outcome: Outcome::Success,
            })
            .inc();
    }

    pub fn record_failure(&self) {
        self.cycles
            .get_or_create(&OutcomeLabels {
                outcome: Outcome::Failure,
            })
            .inc();
    }

    /// Blocks `record` while held.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.update.read().unwrap()
    }

    pub fn download(&self) -> f64 {
        self.download.get()
    }

    pub fn upload(&self) -> f64 {
        self.upload.get()
    }

    /// `None` for a host that has not been measured yet.
    pub fn latency(&self, host: &str) -> Option<f64> {
        match &self.latency {
            LatencyGauge::PerHost(family) => family
                .get(&HostLabels {
                    host: host.to_string(),
                })
                .map(|g| g.get()),
            LatencyGauge::Single(gauge) => Some(gauge.get()),
        }
    }

    pub fn cycles(&self, outcome: Outcome) -> u64 {
        self.cycles.get_or_create(&OutcomeLabels { outcome }).get()
    }
}
