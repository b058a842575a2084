use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDatum {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

impl TelemetryDatum {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// 翻译指标的接收端
///
/// 在协调器的锁内同步调用，实现必须足够轻量。
pub trait TelemetrySink: Send + Sync {
    fn record(&self, datum: TelemetryDatum);
}

/// 默认实现：写到 tracing 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record(&self, datum: TelemetryDatum) {
        debug!(
            target: "nmt_engine::telemetry",
            name = %datum.name,
            value = datum.value,
            unit = %datum.unit,
            "telemetry"
        );
    }
}
