use obstacle_schema::TaxonomyTag;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to build prometheus exporter: {0}")]
    Exporter(String),
}

pub struct Metrics {
    analyses: Counter<u64>,
    classifications: Counter<u64>,
    inference_duration: Histogram<u64>,
    queue_messages: Counter<u64>,
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("obstacle_service");
        global::set_meter_provider(provider.clone());

        let analyses = meter
            .u64_counter("analyses_total")
            .with_description("Number of analyzed batches per surface")
            .build();

        let classifications = meter
            .u64_counter("classifications_total")
            .with_description("Number of per-image classifications per tag")
            .build();

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(generate_boundaries(250.0, 240_000.0, 2.0))
            .with_description("Duration of a single image inference in milliseconds")
            .build();

        let queue_messages = meter
            .u64_counter("queue_messages_total")
            .with_description("Consumed queue messages per handling outcome")
            .build();

        Ok(Metrics {
            analyses,
            classifications,
            inference_duration,
            queue_messages,
            _provider: provider,
            registry,
        })
    }

    pub fn record_analysis(&self, surface: &str) {
        let attributes = [KeyValue::new("surface", surface.to_string())];
        self.analyses.add(1, &attributes);
    }

    pub fn record_classification(&self, tag: TaxonomyTag) {
        let attributes = [KeyValue::new("tag", tag.as_str())];
        self.classifications.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64) {
        self.inference_duration.record(duration_ms, &[]);
    }

    pub fn record_queue_message(&self, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.queue_messages.add(1, &attributes);
    }
}

/// Exponential bucket bounds from `start` up to and including the first bound
/// at or above `end`.
fn generate_boundaries(start: f64, end: f64, factor: f64) -> Vec<f64> {
    let mut boundaries = vec![start];
    let mut current = start;
    while current < end {
        current *= factor;
        boundaries.push(current);
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let get = generate_boundaries(250.0, 2_000.0, 2.0);
        let expected = vec![250.0, 500.0, 1000.0, 2000.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_generate_boundaries_overshoots_end_once() {
        let get = generate_boundaries(100.0, 250.0, 2.0);
        assert_eq!(get, vec![100.0, 200.0, 400.0]);
    }
}
