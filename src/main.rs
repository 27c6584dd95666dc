use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use forgeron::cli::{Cli, ForgeronSubcommand};
use forgeron::config::StorageDriver;
use forgeron::preflight::{PreflightStatus, run_preflight};

static CANCEL: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination_signal(_signal: libc::c_int) {
    CANCEL.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_termination_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_termination_signal as libc::sighandler_t);
    }
}

fn init_logging(verbosity: &str, log_timestamp: bool) {
    let level = match verbosity {
        "panic" | "fatal" | "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if log_timestamp {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.verbosity, cli.log_timestamp);

    if let Some(ForgeronSubcommand::CheckEnvironment) = cli.subcommand {
        let driver = cli
            .storage_driver
            .as_deref()
            .and_then(|raw| raw.parse::<StorageDriver>().ok());
        let report = run_preflight(driver.unwrap_or(StorageDriver::Native), driver.is_some());
        print!("{}", report.render());
        exit(match report.status() {
            PreflightStatus::Error => 2,
            _ => 0,
        });
    }

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("[FATAL] {err}");
            exit(err.exit_code());
        }
    };

    install_signal_handlers();

    match forgeron::pipeline::run(&config, &CANCEL) {
        Ok(summary) => {
            for warning in &summary.warnings {
                eprintln!("[WARN] {warning}");
            }
            for outcome in summary.outcomes.iter().filter(|o| o.succeeded()) {
                match &outcome.digest {
                    Some(digest) => println!("{} pushed ({digest})", outcome.destination),
                    None => println!("{} pushed", outcome.destination),
                }
            }
            exit(0);
        }
        Err(err) => {
            eprintln!("[FATAL] {err}");
            exit(err.exit_code());
        }
    }
}
