use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub mod cancel;
pub mod cli;
pub mod config;
pub mod consent;
pub mod error;
pub mod experiment;
pub mod http_probe;
pub mod prefs;
pub mod telemetry;

use cancel::CancelToken;
use cli::Args;
use config::app_config::{AppConfig, ConsentMode, load_config, setup_resolver, setup_trust_anchors};
use consent::{AutoConsent, ConsentPrompt, TerminalPrompt};
use experiment::Experiment;
use http_probe::prelude::*;
use prefs::sandbox::PreferenceSandbox;
use prefs::{MemoryPreferences, TlsSettings};
use telemetry::client::{FileSink, HttpSink, ReportSink, StdoutSink};
use telemetry::{Reporter, RunReport};

const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(30);

fn to_fixed_width(input: &str, width: usize) -> String {
    use unicode_truncate::UnicodeTruncateStr;

    let (truncated, _) = input.unicode_truncate(width);
    format!("{:<width$}", truncated, width = width)
}

fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .init();
}

fn print_result(result: &ProbeResult, width: usize) {
    let host = to_fixed_width(&result.config.host, width);
    let window = format!("{} - {}", result.config.fallback_limit, result.config.max_version);
    let elapsed = result.elapsed.as_secs_f64() * 1000.0;

    if result.outcome == ProbeOutcome::Loaded {
        println!(
            "[{host}] ✅ {window}: Status: {}, Negotiated: {}, Elapsed: {:.2}ms, Root: {}",
            result.response_code(),
            result
                .info
                .tls_negotiated_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            elapsed,
            match result.info.is_built_in_root() {
                Some(true) => "built-in",
                Some(false) => "not built-in",
                None => "N/A",
            }
        );
    } else {
        let detail = result
            .exception
            .as_deref()
            .or(result.info.error_code)
            .unwrap_or("N/A");
        println!(
            "[{host}] ❌ {window}: {} ({detail}), Class: {}, Elapsed: {:.2}ms",
            result.outcome.event(),
            result
                .info
                .error_class
                .map(|c| c.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            elapsed
        );
    }
}

fn report_sinks(config: &AppConfig) -> anyhow::Result<Vec<Box<dyn ReportSink>>> {
    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if let Some(endpoint) = &config.telemetry_endpoint {
        log::info!("Using telemetry endpoint: {}", endpoint);
        sinks.push(Box::new(HttpSink::new(endpoint, TELEMETRY_TIMEOUT)?));
    }
    if let Some(path) = &config.output {
        sinks.push(Box::new(FileSink::new(path)));
    }
    if sinks.is_empty() {
        sinks.push(Box::new(StdoutSink));
    }
    Ok(sinks)
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    let resolver = setup_resolver(&config.dns_hosts)?;
    let anchors = Arc::new(setup_trust_anchors(&config.trust)?);
    let transport = Arc::new(OpenSslTransport::new(
        resolver,
        config.trust.path().map(Path::to_path_buf),
    ));
    let runner = ProbeRunner::new(transport, anchors, config.timeout);

    let store = Arc::new(MemoryPreferences::new(
        TlsSettings::default(),
        config.user_preferences,
    ));
    let reporter = Reporter::new(config.channel.clone(), report_sinks(&config)?);
    let mut experiment = Experiment::new(PreferenceSandbox::new(store), runner, config.configurations);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted; aborting the current probe and restoring TLS settings");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                log::error!("Interrupted again; exiting");
                std::process::exit(130);
            }
        });
    }

    let report = RunReport::new(Uuid::new_v4());
    log::info!("Starting run {} on channel {}", report.id, reporter.channel());
    reporter.submit_started(&report).await;

    let width = config.max_host_width;
    let (report, exit) = match experiment
        .run(report, &cancel, |result| print_result(result, width))
        .await
    {
        Ok(report) => (report, ExitCode::SUCCESS),
        Err(failure) => {
            log::error!("{}", error::report(&failure));
            (failure.partial, ExitCode::FAILURE)
        }
    };

    let include_certificates = if report.results.is_empty() {
        false
    } else {
        let prompt: Box<dyn ConsentPrompt> = match config.consent {
            ConsentMode::Always => Box::new(AutoConsent(true)),
            ConsentMode::Never => Box::new(AutoConsent(false)),
            ConsentMode::Ask => Box::new(TerminalPrompt),
        };
        let summary = consent::summarize(&report);
        consent::is_permitted_unless_cancelled(prompt.as_ref(), &summary, &cancel).await
    };

    if reporter.submit(report, include_certificates).await == 0 {
        log::warn!("The report was not delivered to any sink");
    }
    Ok(exit)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args).context("failed to load configuration")?;
    run(config).await
}
