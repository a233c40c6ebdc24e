use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rust_scan::option::{OptionType, OptionValue};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to rust_scan.toml)
    #[clap(short, long, value_parser, value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Lists attached scanners
    Devices,
    /// Prints the option model of a scanner
    Options(OptionsCommand),
    /// Scans one image
    Scan(ScanCommand),
}

#[derive(Args)]
pub struct DeviceArg {
    /// Device name as listed by `devices`
    #[clap(short, long, value_parser)]
    pub device: Option<String>,
}

#[derive(Args)]
pub struct OptionsCommand {
    #[clap(flatten)]
    pub device: DeviceArg,
    /// Print the options as JSON
    #[clap(long)]
    pub json: bool,
    /// Include advanced options
    #[clap(long)]
    pub advanced: bool,
}

#[derive(Args)]
pub struct ScanCommand {
    #[clap(flatten)]
    pub device: DeviceArg,
    /// Fast low-resolution scan of the whole area
    #[clap(long)]
    pub preview: bool,
    /// Resolution in DPI on both axes
    #[clap(short, long, value_parser)]
    pub resolution: Option<f64>,
    /// Option assignments applied before scanning, e.g. `mode=Gray`
    #[clap(long = "set", value_parser = parse_assignment)]
    pub assignments: Vec<(String, String)>,
    /// File receiving the raw line data
    #[clap(short, long, value_parser, value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    if name.trim().is_empty() {
        return Err(format!("missing option name in '{s}'"));
    }
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse command-line text for an option of `option_type`. Lists are
/// comma-separated.
pub fn parse_option_value(text: &str, option_type: OptionType) -> Option<OptionValue> {
    let items = || text.split(',').map(str::trim);
    match option_type {
        OptionType::Bool => parse_bool(text).map(OptionValue::Bool),
        OptionType::Int => text.parse().ok().map(OptionValue::Int),
        OptionType::Fixed => text.parse().ok().map(OptionValue::Fixed),
        OptionType::String => Some(OptionValue::String(text.to_string())),
        OptionType::Button | OptionType::Group => Some(OptionValue::None),
        OptionType::BoolList => items()
            .map(parse_bool)
            .collect::<Option<Vec<_>>>()
            .map(OptionValue::BoolList),
        OptionType::IntList => items()
            .map(|s| s.parse().ok())
            .collect::<Option<Vec<_>>>()
            .map(OptionValue::IntList),
        OptionType::FixedList => items()
            .map(|s| s.parse().ok())
            .collect::<Option<Vec<_>>>()
            .map(OptionValue::FixedList),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("mode = Gray"),
            Ok(("mode".to_string(), "Gray".to_string()))
        );
        assert!(parse_assignment("mode").is_err());
        assert!(parse_assignment("=Gray").is_err());
    }

    #[test]
    fn test_parse_option_values() {
        assert_eq!(
            parse_option_value("yes", OptionType::Bool),
            Some(OptionValue::Bool(true))
        );
        assert_eq!(
            parse_option_value("150", OptionType::Int),
            Some(OptionValue::Int(150))
        );
        assert_eq!(
            parse_option_value("215.9", OptionType::Fixed),
            Some(OptionValue::Fixed(215.9))
        );
        assert_eq!(
            parse_option_value("1, 2,3", OptionType::IntList),
            Some(OptionValue::IntList(vec![1, 2, 3]))
        );
        assert_eq!(parse_option_value("lots", OptionType::Int), None);
    }

    #[test]
    fn test_cli_parses_scan_command() {
        let cli = Cli::try_parse_from([
            "rust_scan",
            "scan",
            "--preview",
            "--resolution",
            "150",
            "--set",
            "mode=Gray",
            "--set",
            "brightness=10",
        ])
        .unwrap();
        let Commands::Scan(scan) = cli.command else {
            panic!("expected scan command");
        };
        assert!(scan.preview);
        assert_eq!(scan.resolution, Some(150.0));
        assert_eq!(scan.assignments.len(), 2);
    }
}
