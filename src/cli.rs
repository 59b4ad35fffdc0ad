use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(
    name = "droidstress",
    version,
    about = "adb-driven connectivity, pairing, and flashing stress harness for Android devices",
    after_help = r#"Examples:
  # Run the bluetooth reconnect stress with a plan file
  droidstress run --suite bt-reconnect --plan lab.toml --serial 8XV7N15A

  # Every suite, 25 iterations each, results in ./nightly
  droidstress run --suite all --iterations 25 --results nightly

  # Flash a watch image bundle
  droidstress flash --image-dir ./sturgeon-img --serial FA123"#
)]
pub struct Cli {
    /// Path to the adb binary (defaults to ANDROID_HOME or PATH lookup)
    #[arg(long, global = true)]
    pub adb: Option<PathBuf>,
    /// Timeout for individual adb commands, e.g. "30s"
    #[arg(long, global = true, default_value = "30s", value_parser = parse_duration)]
    pub cmd_timeout: Duration,
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List devices visible to adb
    ListDevices,
    /// Run one stress suite (or all) against a device
    Run(RunArgs),
    /// Flash an image bundle onto a device already in fastboot
    Flash(FlashArgs),
    /// Print the metadata parsed from an image bundle
    FlashInfo {
        #[arg(long)]
        image_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// bt-reconnect, bt-throughput, pairing-stress, wifi-throughput, or all
    #[arg(long)]
    pub suite: String,
    /// Device serial; optional when exactly one device is connected
    #[arg(long)]
    pub serial: Option<String>,
    /// TOML plan file with per-suite options
    #[arg(long)]
    pub plan: Option<PathBuf>,
    /// Override [run].iterations from the plan
    #[arg(long)]
    pub iterations: Option<u32>,
    /// Override [run].results_dir from the plan
    #[arg(long)]
    pub results: Option<PathBuf>,
    /// Ignore the tested-build gate even when the plan configures one
    #[arg(long)]
    pub skip_gate: bool,
}

#[derive(Args, Debug)]
pub struct FlashArgs {
    #[arg(long)]
    pub image_dir: PathBuf,
    #[arg(long)]
    pub serial: String,
    /// Path to the fastboot binary
    #[arg(long)]
    pub fastboot: Option<PathBuf>,
    /// Permit flashing a bootloader/baseband older than the device's
    #[arg(long)]
    pub allow_downgrade: bool,
    /// Reboot to Android when the bundle has no update package
    #[arg(long)]
    pub reboot_after: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_run_invocation() {
        let cli = Cli::try_parse_from([
            "droidstress",
            "run",
            "--suite",
            "bt-reconnect",
            "--serial",
            "FA123",
            "--iterations",
            "25",
            "--cmd-timeout",
            "45s",
        ])
        .unwrap();
        assert_eq!(cli.cmd_timeout, Duration::from_secs(45));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.suite, "bt-reconnect");
                assert_eq!(args.serial.as_deref(), Some("FA123"));
                assert_eq!(args.iterations, Some(25));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(Cli::try_parse_from([
            "droidstress",
            "--cmd-timeout",
            "banana",
            "list-devices"
        ])
        .is_err());
    }
}
