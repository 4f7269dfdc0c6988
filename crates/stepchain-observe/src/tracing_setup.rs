//! Process-wide log and span output for a host running workflows.
//!
//! The runtime and the SQLite store log through `tracing` with
//! `execution_id` and `step_id` fields. A host calls [`init_tracing`] once at
//! startup to print those records, optionally exporting the execution and
//! step spans through OpenTelemetry.
//!
//! ```no_run
//! stepchain_observe::tracing_setup::init_tracing(false).unwrap();
//! // ... run executions ...
//! stepchain_observe::tracing_setup::shutdown_tracing();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Filter used when `RUST_LOG` is unset: lifecycle logs from the stepchain
/// crates, warnings from everything else.
const DEFAULT_FILTER: &str =
    "warn,stepchain_core=info,stepchain_infra=info,stepchain_observe=info";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber for workflow logs.
///
/// Records are filtered by `RUST_LOG`, falling back to `DEFAULT_FILTER`.
/// A closing span prints its duration: `stepchain.execute` and
/// `stepchain.resume` at info, `stepchain.step` at debug. With
/// `enable_otel`, spans also go to a stdout OpenTelemetry exporter under
/// the `stepchain` tracer.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepchain");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush spans still held by the exporter. Call before the host exits;
/// does nothing when `init_tracing` ran without OpenTelemetry.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("stepchain: span exporter shutdown failed: {e}");
        }
    }
}
