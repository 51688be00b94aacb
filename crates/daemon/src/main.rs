use anyhow::Context;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;

use pk_daemon::api;
use pk_daemon::bootstrap;
use pk_daemon::cli::{Cli, Command, ConfigCommand, LoadedConfig};
use pk_domain::config::{LogFormat, ObservabilityConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let loaded = pk_daemon::cli::load_config()?;
            let tracer_provider = init_tracing(&loaded.config.observability);
            run_server(loaded, tracer_provider).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let loaded = pk_daemon::cli::load_config()?;
            if !pk_daemon::cli::config::validate(&loaded.config, &loaded.path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            init_cli_tracing();
            let loaded = pk_daemon::cli::load_config()?;
            pk_daemon::cli::config::show(&loaded.config)
        }
        Some(Command::Version) => {
            println!("presence-keeper {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

const DEFAULT_FILTER: &str = "info,pk_supervisor=debug,pk_daemon=debug";

/// Initialize structured tracing for `serve` in the configured
/// `log_format`, plus an OTLP exporter when an endpoint is configured.
/// The returned provider must be shut down on exit to flush pending spans.
fn init_tracing(
    obs: &ObservabilityConfig,
) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = match obs.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    let Some(endpoint) = obs.otlp_endpoint() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!(
                "WARNING: failed to create OTLP exporter for {endpoint}: {e}; \
                 starting without OpenTelemetry"
            );
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name.clone())
        .build();

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(
            obs.sample_rate,
        ))
        .with_resource(resource)
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("presence-keeper"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Some(tracer_provider)
}

/// Compact stderr-only tracing for one-shot commands, so stdout stays
/// clean for their output.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run_server(
    loaded: LoadedConfig,
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
) -> anyhow::Result<()> {
    tracing::info!(
        config = %loaded.path,
        overrides = ?loaded.overrides,
        "presence-keeper starting"
    );
    let config = std::sync::Arc::new(loaded.config);

    // ── Build runtime & spawn background loops ───────────────────────
    let rt = bootstrap::build_runtime(config.clone())?;
    let tasks = bootstrap::spawn_background_tasks(&rt);

    rt.manager.initialize().await;

    // ── Status server ────────────────────────────────────────────────
    if config.server.enabled {
        let app = api::router()
            .layer(TraceLayer::new_for_http())
            .layer(tower::limit::ConcurrencyLimitLayer::new(64))
            .with_state(rt.state.clone());

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding to {addr}"))?;
        tracing::info!(addr = %addr, "status server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("axum server error")?;
    } else {
        tracing::info!("status server disabled");
        shutdown_signal().await;
    }

    // ── Post-shutdown cleanup ────────────────────────────────────────
    rt.manager.shutdown().await;
    rt.shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    // Flush the OTel tracer provider so pending spans are exported
    // before the process exits.
    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = ?e, "OpenTelemetry tracer provider shutdown failed");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, waiting for SIGINT only");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }
}
