use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use dze_tester::discovery;
use dze_tester::logging::{init_logging_with, parse_level};
use dze_tester::{BenchConfig, BenchError, CancelToken, Outcome, Session, TestProfile};

const EXIT_FAIL: i32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    name = "dze-tester",
    version,
    about = "Drive the DZE regulator test bench over its serial link"
)]
struct Args {
    /// Serial port of the bench controller (discovered over USB when omitted)
    #[arg(long, global = true)]
    port: Option<String>,
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Test profile name (e.g., parallel-v3, parallel-v2)
    #[arg(long, global = true)]
    profile: Option<String>,
    /// Log level (error, warn, info, debug, trace); overrides DZE_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Keep retrying once a second until the bench can be opened
    #[arg(long, global = true)]
    wait: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run one acceptance test and print the result as JSON
    Run,
    /// Print live telemetry as JSON lines until interrupted
    Monitor {
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        /// Stop after this many snapshots
        #[arg(long)]
        count: Option<u64>,
    },
    /// List serial ports, marking the bench controller
    Ports,
    /// List built-in test profiles
    Profiles,
}

fn main() {
    match run() {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    init_logging_with(parse_level(args.log_level.as_deref()));

    let mut config = match &args.config {
        Some(path) => BenchConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BenchConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(profile) = &args.profile {
        config.profile = profile.clone();
        config.custom_profile = None;
    }

    match args.command {
        Cmd::Run => run_test(config, args.wait),
        Cmd::Monitor { interval_ms, count } => {
            monitor(config, args.wait, Duration::from_millis(interval_ms), count)
        }
        Cmd::Ports => list_ports(&config),
        Cmd::Profiles => {
            for name in TestProfile::builtin_names() {
                let p = TestProfile::builtin(name)?;
                println!(
                    "{name}\t{:.2} V ± {:.2} V\tscale {:.4}",
                    p.regulation_setpoint_v, p.regulation_tolerance_v, p.voltage_scale
                );
            }
            Ok(0)
        }
    }
}

fn open_session(config: &BenchConfig, wait: bool) -> Result<Session> {
    loop {
        match Session::open(config.clone()) {
            Ok(session) => return Ok(session),
            Err(e) if wait && (matches!(e, BenchError::PortNotFound(_)) || e.is_link_failure()) => {
                warn!("{e}; retrying in {:?}", RETRY_DELAY);
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e).context("could not start the bench session"),
        }
    }
}

fn install_interrupt(cancel: &CancelToken) -> Result<()> {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping...");
        cancel.cancel();
    })
    .context("installing Ctrl-C handler")
}

fn run_test(config: BenchConfig, wait: bool) -> Result<i32> {
    let mut session = open_session(&config, wait)?;
    let cancel = CancelToken::new();
    install_interrupt(&cancel)?;

    let result = session.run_test(&cancel)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    session.shutdown();

    info!("{:?}: {}", result.outcome, result.message);
    Ok(if result.outcome == Outcome::Pass {
        0
    } else {
        EXIT_FAIL
    })
}

fn monitor(config: BenchConfig, wait: bool, interval: Duration, count: Option<u64>) -> Result<i32> {
    let mut session = open_session(&config, wait)?;
    let cancel = CancelToken::new();
    install_interrupt(&cancel)?;

    let mut printed = 0;
    while !cancel.is_cancelled() && count.map_or(true, |n| printed < n) {
        if !session.is_running() {
            warn!("session stopped");
            break;
        }
        println!("{}", serde_json::to_string(&session.telemetry())?);
        printed += 1;
        thread::sleep(interval);
    }
    session.shutdown();
    Ok(0)
}

fn list_ports(config: &BenchConfig) -> Result<i32> {
    let ports = discovery::list_ports(&config.usb).context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let usb = port
            .usb
            .map(|u| {
                format!(
                    "{:04x}:{:04x} {}",
                    u.vid,
                    u.pid,
                    u.serial_number.unwrap_or_default()
                )
            })
            .unwrap_or_else(|| "-".to_string());
        let mark = if port.is_bench { "  <- bench" } else { "" };
        println!("{}\t{}{}", port.name, usb, mark);
    }
    Ok(0)
}
