mod adb;
mod attenuator;
mod cli;
mod connectivity;
mod core;
mod flasher;
mod gate;
mod pairing;
mod report;
mod suites;

use crate::adb::{AdbClient, DeviceManager};
use crate::cli::{Cli, Commands, FlashArgs, RunArgs};
use crate::core::config::PlanConfig;
use crate::core::telemetry;
use crate::flasher::fastboot::FastbootTool;
use crate::flasher::{DeviceFlasher, FlashImage, FlashOptions};
use crate::gate::{BuildGate, GateDecision, GatePolicy, TcpCounts};
use crate::report::{ConsoleListener, Fanout, JsonlListener, RunListener};
use crate::suites::SuiteContext;
use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level, cli.log_format.eq_ignore_ascii_case("json"), false);

    match cli.command {
        Commands::ListDevices => {
            let client = AdbClient::new(cli.adb.as_deref(), cli.cmd_timeout)
                .context("adb is required; install platform-tools or pass --adb")?;
            list_devices(client).await
        }
        Commands::Run(ref args) => {
            let client = AdbClient::new(cli.adb.as_deref(), cli.cmd_timeout)
                .context("adb is required; install platform-tools or pass --adb")?;
            run_suites(client, args).await
        }
        Commands::Flash(ref args) => flash_device(cli.adb.as_deref(), cli.cmd_timeout, args).await,
        Commands::FlashInfo { ref image_dir } => {
            let image = FlashImage::load(image_dir)?;
            println!("{}", serde_json::to_string_pretty(&image)?);
            Ok(())
        }
    }
}

async fn list_devices(client: AdbClient) -> anyhow::Result<()> {
    client.ensure_present().await?;
    client.start_server().await?;
    let mgr = DeviceManager::new(client);
    let devices = mgr.list_devices().await?;
    if devices.is_empty() {
        println!("{}", "no devices connected".bright_yellow());
        return Ok(());
    }
    let sep = "-".repeat(72);
    println!("{}", sep.bright_black());
    println!(
        "{:<20} {:<14} {:<22} {:<10}",
        "Serial".bright_cyan(),
        "State".bright_cyan(),
        "Device".bright_cyan(),
        "Android".bright_cyan()
    );
    println!("{}", sep.bright_black());
    for d in &devices {
        let detailed = if d.is_online() {
            mgr.describe(&d.serial).await.unwrap_or_else(|_| d.clone())
        } else {
            d.clone()
        };
        println!(
            "{:<20} {:<14} {:<22} {:<10}",
            detailed.serial,
            detailed.state,
            detailed.display_name(),
            detailed.android_version.as_deref().unwrap_or("-")
        );
    }
    println!("{}", sep.bright_black());
    Ok(())
}

async fn run_suites(client: AdbClient, args: &RunArgs) -> anyhow::Result<()> {
    client.ensure_present().await?;
    client.start_server().await?;

    let mut plan = match &args.plan {
        Some(path) => PlanConfig::load(path)
            .with_context(|| format!("loading plan {}", path.display()))?,
        None => PlanConfig::default(),
    };
    if let Some(n) = args.iterations {
        plan.run.iterations = n;
    }
    if let Some(dir) = &args.results {
        plan.run.results_dir = dir.clone();
    }

    let mgr = DeviceManager::new(client.clone());
    let device = mgr.pick(args.serial.as_deref()).await?;
    info!(serial = %device.serial, model = ?device.model, "selected device");

    if !args.skip_gate {
        if let Some(endpoint) = plan.gate.endpoint.clone() {
            let build_id = match &plan.gate.build_id {
                Some(id) => id.clone(),
                None => {
                    mgr.get_prop(&device.serial, "ro.build.version.incremental")
                        .await?
                }
            };
            let flavor = match &plan.gate.flavor {
                Some(f) => f.clone(),
                None => mgr
                    .get_prop(&device.serial, "ro.build.flavor")
                    .await
                    .unwrap_or_default(),
            };
            let counts = TcpCounts::new(endpoint, Duration::from_secs(plan.gate.timeout_secs));
            let gate = BuildGate::new(plan.gate.max_runs, GatePolicy::parse(&plan.gate.policy)?);
            match gate.should_run(&counts, &build_id, &flavor).await {
                GateDecision::Skip(reason) => {
                    println!("{} {reason}", "[GATE]".bright_yellow());
                    return Ok(());
                }
                GateDecision::Run => gate.record(&counts, &build_id, &flavor).await,
            }
        }
    }

    let selected = suites::suites_for(&args.suite).with_context(|| {
        format!(
            "unknown suite '{}'; known: {}, all",
            args.suite,
            suites::suite_names().join(", ")
        )
    })?;

    let results_dir = plan.run.results_dir.clone();
    let jsonl = JsonlListener::create(&results_dir.join("results.jsonl"))?;
    let mut listener = Fanout::new(vec![Box::new(ConsoleListener), Box::new(jsonl)]);

    let ctx = SuiteContext {
        client,
        serial: device.serial.clone(),
        plan,
        results_dir,
    };
    let mut failures = 0u32;
    for suite in &selected {
        listener.suite_started(suite.name());
        let summary = suite.run(&ctx, &mut listener).await?;
        listener.suite_finished(&summary);
        if !summary.succeeded() {
            failures += 1;
        }
    }
    if failures > 0 {
        eprintln!("{} {failures} suite(s) failed", "error:".bright_red().bold());
        std::process::exit(1);
    }
    Ok(())
}

async fn flash_device(
    adb: Option<&std::path::Path>,
    cmd_timeout: Duration,
    args: &FlashArgs,
) -> anyhow::Result<()> {
    let image = FlashImage::load(&args.image_dir)?;
    info!(board = %image.board, bootloader = ?image.bootloader_version, "loaded image bundle");

    // when the device is still booted into Android, check the battery and
    // drop it into the bootloader ourselves
    let mgr = AdbClient::new(adb, cmd_timeout).ok().map(DeviceManager::new);
    let mut entered_via_adb = false;
    if let Some(mgr) = &mgr {
        if let Ok(device) = mgr.describe(&args.serial).await {
            if device.is_online() {
                if let Ok(Some(level)) = mgr.battery_level(&args.serial).await {
                    if level < 20 {
                        anyhow::bail!("battery at {level}%; charge above 20% before flashing");
                    }
                }
                info!(serial = %args.serial, "rebooting into bootloader");
                mgr.reboot_bootloader(&args.serial).await?;
                entered_via_adb = true;
            }
        }
    }

    let tool = FastbootTool::new(args.fastboot.as_deref())?;
    let flasher = DeviceFlasher::new(&tool);
    let outcome = flasher
        .flash(
            &args.serial,
            &image,
            FlashOptions {
                allow_downgrade: args.allow_downgrade,
                reboot_after: args.reboot_after,
            },
        )
        .await?;
    println!(
        "{} bootloader={} radio={} system={}",
        "[FLASH]".bright_green(),
        outcome.flashed_bootloader,
        outcome.flashed_radio,
        outcome.updated_system
    );

    if entered_via_adb && (outcome.updated_system || args.reboot_after) {
        if let Some(mgr) = &mgr {
            let spec = crate::core::poll::PollSpec::from_secs(300, 5);
            if !mgr.wait_until_online(&args.serial, spec).await? {
                warn!(serial = %args.serial, "device did not come back online within 300s");
            }
        }
    }
    Ok(())
}
