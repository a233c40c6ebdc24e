//! rust_scan - command-line scanner front end
//!
//! Lists devices, prints option models and runs scans through the background
//! worker. Without the `sane_hardware` feature it drives the simulated
//! flatbed.

mod cli;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_scan::acquisition::{Resolution, ScanImage};
use rust_scan::config::ScanConfig;
use rust_scan::device::{enumerate_devices, ScannerBackend};
use rust_scan::option::{DeviceOption, OptionType};
use rust_scan::scanner::{Scanner, WriteOutcome};
use rust_scan::worker::{ScanCompletion, ScanWorker, WorkerEvent};

use crate::cli::{Cli, Commands, OptionsCommand, ScanCommand};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ScanConfig::load_from(path),
        None => ScanConfig::load(),
    }
    .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level)),
        )
        .init();

    let backend = create_backend();
    backend.init().context("Failed to initialize scanner backend")?;

    let result = match cli.command {
        Commands::Devices => list_devices(backend.as_ref(), &config),
        Commands::Options(args) => show_options(backend.as_ref(), &config, &args),
        Commands::Scan(args) => run_scan(backend.as_ref(), &config, args).await,
    };

    backend.exit();
    result
}

#[cfg(feature = "sane_hardware")]
fn create_backend() -> Box<dyn ScannerBackend> {
    Box::new(rust_scan::device::sane::SaneBackend::new())
}

#[cfg(not(feature = "sane_hardware"))]
fn create_backend() -> Box<dyn ScannerBackend> {
    warn!("Built without sane_hardware, using the simulated flatbed");
    Box::new(rust_scan::device::mock::MockBackend::new())
}

fn list_devices(backend: &dyn ScannerBackend, config: &ScanConfig) -> Result<()> {
    let devices = enumerate_devices(backend, config.devices.local_only)
        .context("Failed to enumerate devices")?;
    if devices.is_empty() {
        println!("No scanners found");
    }
    for device in devices {
        println!(
            "{:<40} {} ({})",
            device.name,
            device.display_name(),
            device.device_type
        );
    }
    Ok(())
}

/// Explicit name, then configured default, then the first device found.
fn resolve_device(
    backend: &dyn ScannerBackend,
    config: &ScanConfig,
    requested: Option<&str>,
) -> Result<String> {
    if let Some(name) = requested.or(config.devices.default_device.as_deref()) {
        return Ok(name.to_string());
    }
    enumerate_devices(backend, config.devices.local_only)?
        .into_iter()
        .next()
        .map(|device| device.name)
        .ok_or_else(|| anyhow!("No scanners found"))
}

fn open_scanner(
    backend: &dyn ScannerBackend,
    config: &ScanConfig,
    requested: Option<&str>,
) -> Result<Scanner> {
    let name = resolve_device(backend, config, requested)?;
    Scanner::open(backend, &name).with_context(|| format!("Failed to open '{name}'"))
}

fn describe(option: &DeviceOption) -> String {
    let unit = option.unit().label();
    let mut line = format!("  {:<24} {}{}", option.name(), option.value(), unit);
    if option.constraint().is_list() {
        let values: Vec<String> = option
            .constraint()
            .allowed_values()
            .iter()
            .map(ToString::to_string)
            .collect();
        line.push_str(&format!("  [{}]", values.join("|")));
    } else if let Some(range) = option.constraint().range() {
        line.push_str(&format!("  [{}..{}{}]", range.min, range.max, unit));
    }
    if !option.is_active() {
        line.push_str("  (inactive)");
    }
    if !option.is_settable() {
        line.push_str("  (read-only)");
    }
    line
}

fn show_options(
    backend: &dyn ScannerBackend,
    config: &ScanConfig,
    args: &OptionsCommand,
) -> Result<()> {
    let scanner = open_scanner(backend, config, args.device.device.as_deref())?;
    let options: Vec<DeviceOption> = scanner
        .options()
        .into_iter()
        .filter(|option| args.advanced || !option.is_advanced())
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&options)?);
        return Ok(());
    }

    println!("{}", scanner.name());
    for option in &options {
        match option.option_type() {
            OptionType::Group => println!("{}:", option.title()),
            _ => println!("{}", describe(option)),
        }
    }
    Ok(())
}

fn apply_assignments(scanner: &Scanner, args: &ScanCommand) -> Result<()> {
    if let Some(dpi) = args.resolution {
        scanner.set_resolution(Resolution::uniform(dpi))?;
    }
    for (name, text) in &args.assignments {
        let option = scanner
            .find_option(name)
            .ok_or_else(|| anyhow!("Unknown option '{name}'"))?;
        let value = cli::parse_option_value(text, option.option_type())
            .ok_or_else(|| anyhow!("Cannot use '{text}' for option '{name}'"))?;
        match scanner.set_option_value(name, value)? {
            WriteOutcome::Ignored => warn!("Option '{}' cannot be set right now", name),
            outcome => info!("{} = {} ({:?})", name, text, outcome),
        }
    }
    Ok(())
}

async fn run_scan(
    backend: &dyn ScannerBackend,
    config: &ScanConfig,
    args: ScanCommand,
) -> Result<()> {
    let scanner = Arc::new(open_scanner(backend, config, args.device.device.as_deref())?);
    apply_assignments(&scanner, &args)?;

    let mut output = match &args.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let (worker, mut events) = ScanWorker::spawn(&config.worker)?;
    if !worker.scan(scanner.clone(), args.preview) {
        return Err(anyhow!("Scan worker refused the request"));
    }

    let mut image: Option<ScanImage> = None;
    let completion = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(WorkerEvent::ScanStarted(started)) => {
                    println!(
                        "Scanning {}x{} px at {} dots/m",
                        started.width, started.height, started.dots_per_meter_x
                    );
                    image = Some(started);
                }
                Some(WorkerEvent::LineScanned { index, data }) => {
                    if let Some(out) = output.as_mut() {
                        out.write_all(&data)?;
                    }
                    if let Some(image) = image.as_mut() {
                        image.write_line(index, &data);
                    }
                }
                Some(WorkerEvent::ScanComplete(completion)) => break completion,
                None => break ScanCompletion::Failed("scan worker stopped".to_string()),
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelling...");
                worker.cancel_scan();
            }
        }
    };

    if let Some(mut out) = output {
        out.flush()?;
    }
    worker.shutdown();

    match completion {
        ScanCompletion::Finished => {
            let lines = image.map_or(0, |image| image.height);
            println!("Scan finished, {lines} lines");
            Ok(())
        }
        ScanCompletion::Cancelled => {
            println!("Scan cancelled");
            Ok(())
        }
        ScanCompletion::Failed(reason) => Err(anyhow!("Scan failed: {reason}")),
    }
}
