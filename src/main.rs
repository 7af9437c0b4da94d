use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transformer_forecast::cli::Args;
use transformer_forecast::config::{Config, LiveSourceKind};
use transformer_forecast::coordinator::{BackfillRange, Coordinator, CoordinatorSettings, RunReport};
use transformer_forecast::feed::FeedSink;
use transformer_forecast::pipeline::{run_status_logger, PipelineStats};
use transformer_forecast::registry::SensorRegistry;
use transformer_forecast::sink::{CsvSink, ForecastSink, LogSink, SinkSet};
use transformer_forecast::source::{
    CloudApi, CsvFileSource, DeviceDirectory, HistorySource, LiveSource, MqttLiveSource,
};

const FEED_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,transformer_forecast=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "transformer-forecast"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn coordinator_settings(args: &Args, config: &Config, backfill: Option<BackfillRange>) -> CoordinatorSettings {
    CoordinatorSettings {
        backfill,
        live: args.live(),
        emit_backfill_forecasts: args.emit_backfill,
        backfill_page_retries: config.backfill_page_retries,
        max_reconnect_attempts: config.max_reconnect_attempts,
        backoff_base: config.backoff_base(),
        backoff_max: config.backoff_max(),
        live_idle_timeout: config.live_idle_timeout(),
        summary_steps: args.summary_steps,
    }
}

async fn discover(config: &Config, directory: &dyn DeviceDirectory) -> Result<SensorRegistry> {
    let mut registry = SensorRegistry::new(config.params.clone());
    registry
        .discover(directory)
        .await
        .context("sensor discovery failed")?;
    Ok(registry)
}

async fn run_local(
    args: &Args,
    config: &Config,
    sinks: Arc<dyn ForecastSink>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let Some(path) = args.path.as_ref() else {
        bail!("local mode needs --path");
    };
    let source = CsvFileSource::open(path, config.page_size as usize)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let Some((first, last)) = source.span() else {
        bail!("{} contains no readings", path.display());
    };
    let range = BackfillRange {
        start: args.starttime.unwrap_or(first),
        end: args.endtime.unwrap_or(last),
    };

    let registry = discover(config, &source).await?;
    let settings = coordinator_settings(args, config, Some(range));
    let mut coordinator = Coordinator::new(registry, sinks, stats, settings, cancel);
    Ok(coordinator.run(Some(&source), None).await)
}

async fn run_cloud(
    args: &Args,
    config: &Config,
    sinks: Arc<dyn ForecastSink>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let (project_id, credentials) = config.cloud_credentials()?;
    let api = CloudApi::new(&config.api_url, project_id, credentials, config.page_size)
        .context("failed to build API client")?;

    let backfill = match args.starttime {
        Some(start) => {
            let end = args.endtime.unwrap_or_else(Utc::now);
            if start >= end {
                bail!("--starttime {start} must be before --endtime {end}");
            }
            Some(BackfillRange { start, end })
        }
        None => None,
    };

    let registry = discover(config, &api).await?;
    let settings = coordinator_settings(args, config, backfill);
    let mut coordinator = Coordinator::new(registry, sinks, stats, settings, cancel);

    let mqtt;
    let live: Option<&dyn LiveSource> = match (args.live(), config.live_source) {
        (false, _) => None,
        (true, LiveSourceKind::Cloud) => Some(&api),
        (true, LiveSourceKind::Mqtt) => {
            mqtt = MqttLiveSource::new(config.mqtt_settings());
            Some(&mqtt)
        }
    };
    let history: Option<&dyn HistorySource> = Some(&api);
    Ok(coordinator.run(history, live).await)
}

fn log_report(report: &RunReport) {
    for err in &report.backfill_errors {
        tracing::warn!(error=%err, "backfill incomplete");
    }
    for (sensor, path) in &report.summaries {
        if path.is_empty() {
            tracing::info!(sensor=%sensor, "no forecast available");
            continue;
        }
        for point in path {
            tracing::info!(
                sensor=%sensor,
                ts=%point.timestamp,
                value = point.value,
                lower = point.lower_bound,
                upper = point.upper_bound,
                "forecast path"
            );
        }
    }
    let anomalies = report.anomalies;
    tracing::info!(
        stale = anomalies.stale,
        reordered = anomalies.reordered,
        replaced = anomalies.replaced,
        invalid = anomalies.invalid,
        outliers = anomalies.outliers,
        level_shifts = anomalies.level_shifts,
        gap_resets = anomalies.gap_resets,
        divergences = anomalies.divergences,
        "anomaly totals"
    );
    let stats = report.stats;
    tracing::info!(
        ingested = stats.events_ingested,
        emitted = stats.forecasts_emitted,
        suppressed = stats.forecasts_suppressed,
        anomalies = stats.ordering_anomalies,
        reconnects = stats.reconnects,
        cancelled = report.cancelled,
        "run finished"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let stats = PipelineStats::new();
    let cancel = CancellationToken::new();

    let mut sinks = SinkSet::new(args.record_events).with(Arc::new(LogSink));
    if let Some(path) = &args.forecast_csv {
        let csv = CsvSink::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        sinks = sinks.with(Arc::new(csv));
    }
    let mut feed_handle = None;
    if let Some(settings) = config.feed_settings() {
        let (feed, handle) = FeedSink::spawn(settings);
        sinks = sinks.with(Arc::new(feed));
        feed_handle = Some(handle);
    }
    let sinks: Arc<dyn ForecastSink> = Arc::new(sinks);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });
    let status_cancel = cancel.child_token();
    let status_handle = tokio::spawn(run_status_logger(
        stats.clone(),
        config.status_interval(),
        status_cancel.clone(),
    ));

    let result = if args.local() {
        run_local(&args, &config, sinks, stats.clone(), cancel.clone()).await
    } else {
        run_cloud(&args, &config, sinks, stats.clone(), cancel.clone()).await
    };

    status_cancel.cancel();
    let _ = status_handle.await;
    if let Some(handle) = feed_handle {
        if tokio::time::timeout(FEED_DRAIN_TIMEOUT, handle).await.is_err() {
            tracing::warn!("forecast feed did not drain before shutdown");
        }
    }

    let report = result?;
    log_report(&report);
    match report.live_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
