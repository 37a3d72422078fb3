// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logtrail::init::args::StartArgs;
use logtrail::receivers::file::{FileReceiver, WriterSink};

type BoxError = Box<dyn Error + Send + Sync>;

// The receiver bounds each of its own shutdown steps, this only guards
// against it hanging as a whole.
const RECEIVER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Tail a directory and write every record to stdout
    Start(Box<StartArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logtrail")]
#[command(bin_name = "logtrail")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGTRAIL_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(args)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_receiver(args) {
                error!(error = e, "Failed to run receiver.");
                return ExitCode::from(1);
            }
        }
        None => {
            // unreachable, a subcommand is required
            eprintln!("ERROR: Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_receiver(args: Box<StartArgs>) -> Result<(), BoxError> {
    let config = args.file_receiver.build_config();
    let receiver = FileReceiver::new(config)?;
    let sink = Arc::new(WriterSink::new(std::io::stdout(), receiver.registry()));

    let cancel_token = CancellationToken::new();
    let mut receiver_task = tokio::spawn(receiver.run(sink, cancel_token.clone()));

    select! {
        _ = signal_wait() => {
            info!("Shutdown signal received.");
            cancel_token.cancel();
        },
        res = &mut receiver_task => {
            return res?.map_err(Into::into);
        },
    }

    match timeout(RECEIVER_STOP_TIMEOUT, receiver_task).await {
        Ok(res) => res?.map_err(Into::into),
        Err(_) => Err("timeout waiting for receiver to stop".into()),
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

// Records go to stdout, so logs are written to stderr.
fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("notify=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stderr().is_terminal();

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(stderr_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[cfg(unix)]
async fn signal_wait() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sig_term, mut sig_int) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

#[cfg(not(unix))]
async fn signal_wait() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
