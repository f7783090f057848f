//! Tracing setup for the control plane.
//!
//! Console logs are always on. Span export to an OTLP collector is wired
//! only when an endpoint is configured and the sample ratio is nonzero; the
//! spans worth sampling here are the sandbox lifecycle ones (provisioning,
//! sweeps, lifecycle verbs), which all carry `sandbox_id` fields from their
//! `#[instrument]` sites. A broken exporter configuration degrades to
//! console-only logging instead of refusing to start.

use std::env;

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{self, Sampler};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Span-export settings resolved from the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSettings {
    pub endpoint: Option<String>,
    pub sample_ratio: f64,
}

impl ExportSettings {
    pub fn from_env() -> (Self, Vec<String>) {
        Self::resolve(
            env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            env::var("ISLET_OTEL_SAMPLING_RATE").ok(),
        )
    }

    /// Pure resolution step, split out so it can be exercised without
    /// touching the process environment.
    fn resolve(endpoint: Option<String>, ratio_raw: Option<String>) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();

        let endpoint = endpoint
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let sample_ratio = match ratio_raw.as_deref().map(str::trim) {
            None | Some("") => 1.0,
            Some(raw) => match raw.parse::<f64>() {
                Ok(ratio) if (0.0..=1.0).contains(&ratio) => ratio,
                Ok(ratio) => {
                    let clamped = ratio.clamp(0.0, 1.0);
                    warnings.push(format!(
                        "ISLET_OTEL_SAMPLING_RATE={ratio} is outside 0..=1; using {clamped}"
                    ));
                    clamped
                }
                Err(_) => {
                    warnings.push(format!(
                        "ISLET_OTEL_SAMPLING_RATE={raw:?} is not a number; sampling everything"
                    ));
                    1.0
                }
            },
        };

        (
            Self {
                endpoint,
                sample_ratio,
            },
            warnings,
        )
    }

    fn exports_spans(&self) -> bool {
        self.endpoint.is_some() && self.sample_ratio > 0.0
    }
}

/// Flushes buffered spans on drop when an exporter was installed.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    flush_on_drop: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.flush_on_drop {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> TelemetryGuard {
    let (settings, warnings) = ExportSettings::from_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let span_layer = if settings.exports_spans() {
        match install_tracer(service_name, &settings) {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(error) => {
                // Deferred: the subscriber is not up yet, so surface this
                // after init below.
                eprintln!("islet-daemon: OTLP exporter failed to initialize: {error}");
                None
            }
        }
    } else {
        None
    };
    let flush_on_drop = span_layer.is_some();

    tracing_subscriber::registry()
        .with(span_layer)
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    for message in warnings {
        warn!("{message}");
    }
    info!(
        sample_ratio = settings.sample_ratio,
        spans_exported = flush_on_drop,
        "telemetry ready"
    );

    TelemetryGuard { flush_on_drop }
}

fn install_tracer(
    service_name: &str,
    settings: &ExportSettings,
) -> Result<trace::Tracer, opentelemetry::trace::TraceError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new([
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new(
            "deployment.environment",
            env::var("ISLET_ENV").unwrap_or_else(|_| "development".to_string()),
        ),
    ]);

    // Child spans (store calls under a lifecycle span) follow their parent's
    // sampling decision so a sampled provisioning trace stays whole.
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        settings.sample_ratio,
    )));

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(sampler)
                .with_resource(resource),
        )
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .install_batch(Tokio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sample_everything_without_exporting() {
        let (settings, warnings) = ExportSettings::resolve(None, None);
        assert_eq!(settings.sample_ratio, 1.0);
        assert!(settings.endpoint.is_none());
        assert!(!settings.exports_spans());
        assert!(warnings.is_empty());
    }

    #[test]
    fn exporting_requires_endpoint_and_nonzero_ratio() {
        let (with_endpoint, _) = ExportSettings::resolve(
            Some("http://collector:4317".to_string()),
            Some("0.5".to_string()),
        );
        assert!(with_endpoint.exports_spans());

        let (zero_ratio, _) = ExportSettings::resolve(
            Some("http://collector:4317".to_string()),
            Some("0".to_string()),
        );
        assert!(!zero_ratio.exports_spans());

        let (blank_endpoint, _) =
            ExportSettings::resolve(Some("   ".to_string()), Some("1".to_string()));
        assert!(!blank_endpoint.exports_spans());
    }

    #[test]
    fn out_of_range_ratio_clamps_with_warning() {
        let (settings, warnings) = ExportSettings::resolve(None, Some("2.5".to_string()));
        assert_eq!(settings.sample_ratio, 1.0);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("outside"));

        let (settings, warnings) = ExportSettings::resolve(None, Some("-1".to_string()));
        assert_eq!(settings.sample_ratio, 0.0);
        assert!(warnings[0].contains("outside"));
    }

    #[test]
    fn unparseable_ratio_falls_back_to_full_sampling() {
        let (settings, warnings) = ExportSettings::resolve(None, Some("lots".to_string()));
        assert_eq!(settings.sample_ratio, 1.0);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("not a number"));

        let (settings, warnings) = ExportSettings::resolve(None, Some("  ".to_string()));
        assert_eq!(settings.sample_ratio, 1.0);
        assert!(warnings.is_empty());
    }
}
