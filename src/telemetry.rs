use opentelemetry::sdk::{propagation::TraceContextPropagator, trace as sdktrace, Resource};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Installs the global subscriber: `RUST_LOG` filtered fmt output (default
/// `info`), plus OTLP span export when an endpoint is configured.
pub fn init_telemetry(service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(endpoint) = otlp_endpoint else {
        Registry::default().with(env_filter).with(fmt_layer).init();
        return Ok(());
    };

    global::set_text_map_propagator(TraceContextPropagator::new());

    let trace_config = sdktrace::config()
        .with_resource(Resource::new(vec![KeyValue::new("service.name", service_name.to_string())]));

    // 4317 is the gRPC port; anything else is treated as OTLP/HTTP
    let tracer = if endpoint.contains("4317") {
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .with_trace_config(trace_config)
            .install_batch(opentelemetry::runtime::Tokio)?
    } else {
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(endpoint)
                    .with_protocol(opentelemetry_otlp::Protocol::HttpBinary),
            )
            .with_trace_config(trace_config)
            .install_batch(opentelemetry::runtime::Tokio)?
    };

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    Ok(())
}

pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
