//! capture-sim: drives the capture pipeline with simulated collaborators.
//!
//! Usage:
//!   capture-sim simulate [--config <path>] [--items <n>] [--fail-every <k>]
//!   capture-sim config [--config <path>]
//!   capture-sim version

use async_trait::async_trait;
use bytes::Bytes;
use capture_batch::collaborators::{Downloader, ExtractedRecord, Extraction, Extractor, Notifier};
use capture_batch::telemetry::{init_tracing, log_stats};
use capture_batch::tier::ExtractorTier;
use capture_batch::{CaptureConfig, CaptureService, Error};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]),
        "config" => cmd_config(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("capture-sim {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"capture-sim: batch capture pipeline simulator

USAGE:
    capture-sim <COMMAND> [OPTIONS]

COMMANDS:
    simulate [--config <path>] [--items <n>] [--fail-every <k>]
                                Submit a burst of items and print the report
    config [--config <path>]    Print the effective configuration as YAML
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    CAPTURE_*                   Configuration overrides (see crate docs)
    RUST_LOG                    Log filter (default: info)"#
    );
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> CaptureConfig {
    let path = flag_value(args, "--config").map(PathBuf::from);
    match CaptureConfig::load(path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_config(args: &[String]) {
    let cfg = load_config(args);
    match serde_yaml::to_string(&cfg) {
        Ok(yaml) => print!("{yaml}"),
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_simulate(args: &[String]) {
    let cfg = load_config(args);
    let items: usize = flag_value(args, "--items")
        .and_then(|v| v.parse().ok())
        .unwrap_or(6);
    let fail_every: usize = flag_value(args, "--fail-every")
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);

    init_tracing("info");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(simulate(cfg, items, fail_every)) {
        eprintln!("❌ Simulation failed: {e}");
        std::process::exit(1);
    }
}

async fn simulate(cfg: CaptureConfig, items: usize, fail_every: usize) -> capture_batch::Result<()> {
    let service = CaptureService::builder(cfg)
        .downloader(Arc::new(SimDownloader))
        .tier(Arc::new(ExtractorTier::new(
            "fast",
            Arc::new(SimExtractor {
                latency: Duration::from_millis(150),
                fail_every,
            }),
        )))
        .tier(Arc::new(ExtractorTier::new(
            "thorough",
            Arc::new(SimExtractor {
                latency: Duration::from_millis(600),
                fail_every: 0,
            }),
        )))
        .notifier(Arc::new(StdoutNotifier))
        .build()?;
    service.start()?;

    println!("📤 Submitting {items} item(s) for sim-user");
    for n in 1..=items {
        let added = service.submit(
            "sim-user",
            &format!("sim://card-{n}"),
            "sim-chat",
            BTreeMap::new(),
        );
        if !added.accepted() {
            println!("  ⚠️ item {n} rejected");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    service.stop().await;
    log_stats(&service);
    Ok(())
}

struct SimDownloader;

#[async_trait]
impl Downloader for SimDownloader {
    async fn fetch(&self, item_ref: &str) -> capture_batch::Result<Bytes> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Bytes::copy_from_slice(item_ref.as_bytes()))
    }
}

/// Fails transiently on every `fail_every`-th card; `0` never fails.
struct SimExtractor {
    latency: Duration,
    fail_every: usize,
}

#[async_trait]
impl Extractor for SimExtractor {
    async fn analyze(&self, payload: &Bytes) -> capture_batch::Result<Extraction> {
        tokio::time::sleep(self.latency).await;
        let item_ref = String::from_utf8_lossy(payload);
        let n: usize = item_ref
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(Error::transient(format!("simulated connection reset on card {n}")));
        }
        Ok(Extraction::Record(
            ExtractedRecord::new()
                .with_name(format!("Person {n}"))
                .with_company("Example Corp")
                .with_title("Engineer")
                .with_confidence(0.9),
        ))
    }
}

struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn send(&self, target: &str, message: &str) -> capture_batch::Result<()> {
        println!("--- to {target} ---\n{message}\n");
        Ok(())
    }
}
