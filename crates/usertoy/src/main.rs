use std::process;

use kerneltoy::{
    Command, DriverLifecycle, DriverSession, Harness, HarnessOutcome, KERNELTOY_VERSION,
    LifecycleConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(HarnessOutcome::EXIT_QUERY_FAILED);
        }
    };

    init_tracing();

    match run(command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(HarnessOutcome::EXIT_QUERY_FAILED);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: usertoy <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  hal-timer     Query the HAL platform timer sources");
    eprintln!("  data-probe    Query the data probe counters (read/write access)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  KERNELTOY_LOG                 debug|info|warn|error [default: warn]");
    eprintln!("  LOG_FORMAT=json               Emit logs as JSON");
    eprintln!("  KERNELTOY_STOP_TIMEOUT_SECS   Driver stop timeout [default: 30]");
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut command: Option<Command> = None;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if command.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                command = Some(arg.parse().map_err(|e| format!("{e}"))?);
            }
        }
    }

    command.ok_or_else(|| "missing required argument: <command>".to_string())
}

/// Initialize tracing with KERNELTOY_LOG and LOG_FORMAT support.
///
/// Logs go to stderr so the report on stdout stays clean.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("KERNELTOY_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("kerneltoy={level},usertoy={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(command: Command) -> anyhow::Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!(version = KERNELTOY_VERSION, %command, "usertoy starting");

    let session = DriverSession::new();
    let outcome = runtime.block_on(async {
        let harness = build_harness();
        harness.run(&session, command).await
    });

    report(&outcome);
    Ok(outcome.exit_code())
}

#[cfg(windows)]
fn build_harness() -> Harness<kerneltoy::service::WindowsScm> {
    use kerneltoy::channel::DeviceOpener;
    use kerneltoy::service::WindowsScm;

    let lifecycle = DriverLifecycle::new(WindowsScm).with_config(LifecycleConfig::from_env());
    Harness::new(lifecycle, DeviceOpener::default())
}

/// Without a service control manager, run against the in-process device.
#[cfg(not(windows))]
fn build_harness() -> Harness<kerneltoy::SimulatedScm> {
    use std::sync::Arc;

    use kerneltoy::service::DRIVER_FILE_NAME;
    use kerneltoy::{LoopbackOpener, SimulatedPlatform, SimulatedScm};

    tracing::info!("No service control manager on this platform, using simulated backends");
    let scm = SimulatedScm::new();
    let presence = scm.clone();
    let opener = LoopbackOpener::new(Arc::new(SimulatedPlatform::default()))
        .with_presence(move || presence.is_driver_running(DRIVER_FILE_NAME));
    let lifecycle = DriverLifecycle::new(scm).with_config(LifecycleConfig::from_env());
    Harness::new(lifecycle, opener)
}

fn report(outcome: &HarnessOutcome) {
    match &outcome.query {
        Ok(report) => {
            if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
                match serde_json::to_string(report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("error: failed to serialize report: {e}"),
                }
            } else {
                print!("{report}");
            }
        }
        Err(e) => eprintln!("error: {e}"),
    }

    if let Err(e) = &outcome.unload {
        eprintln!("error: failed to unload driver: {e}");
    }
}
