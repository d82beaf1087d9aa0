//! Nimbus entry point.
//!
//! `nimbus up --assembly <dir>` loads a synthesized cloud assembly, builds
//! the application graph, refuses to start on dependency cycles, and serves
//! the emulated services until interrupted. Exit codes: 0 on clean
//! shutdown, 1 on forced exit (second signal), 2 on startup failure.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use nimbus_core::{config::init_logging, EmulatorConfig};
use nimbus_graph::{build_graph, load_assembly};
use nimbus_runtime::{bind, Emulator};

#[derive(Parser)]
#[command(name = "nimbus", version, about = "Local-development emulator for managed cloud services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring an assembly up and serve it until interrupted.
    Up {
        /// Directory containing the synthesized cloud assembly.
        #[arg(long)]
        assembly: PathBuf,
        /// Primary listening port; service surfaces allocate upward.
        #[arg(long, default_value_t = 4600)]
        port: u16,
        /// Location for persisted state.
        #[arg(long, default_value = ".nimbus")]
        data_dir: PathBuf,
        /// Discard state between restarts.
        #[arg(long)]
        no_persist: bool,
        /// Log threshold (an env-filter directive).
        #[arg(long, default_value = "info")]
        log_level: String,
        /// Artificial delay before stream dispatch, in milliseconds.
        #[arg(long, default_value_t = 0)]
        eventual_consistency_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Up {
            assembly,
            port,
            data_dir,
            no_persist,
            log_level,
            eventual_consistency_delay_ms,
        } => {
            let config = EmulatorConfig {
                port,
                persist: !no_persist,
                data_dir,
                log_level,
                eventual_consistency_delay: Duration::from_millis(eventual_consistency_delay_ms),
                ..EmulatorConfig::default()
            };
            run_up(&assembly, config).await
        }
    };
    std::process::exit(code);
}

async fn run_up(assembly_dir: &PathBuf, config: EmulatorConfig) -> i32 {
    init_logging(&config.log_level);

    let assembly = match load_assembly(assembly_dir) {
        Ok(assembly) => assembly,
        Err(err) => {
            tracing::error!(error = %err, "failed to load assembly");
            return 2;
        }
    };
    let graph = match build_graph(&assembly.resources) {
        Ok(graph) => graph,
        Err(err) => {
            tracing::error!(error = %err, "failed to build application graph");
            return 2;
        }
    };
    let cycles = graph.detect_cycles();
    if !cycles.is_empty() {
        tracing::error!(?cycles, "assembly has dependency cycles, refusing to start");
        return 2;
    }

    let app = match bind(&assembly, &graph, &config) {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind providers");
            return 2;
        }
    };
    let emulator = match Emulator::launch(app, &config).await {
        Ok(emulator) => emulator,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            return 2;
        }
    };

    install_signal_handlers(&emulator);
    tracing::info!(port = config.port, "nimbus is up");
    emulator.wait_for_shutdown().await;
    emulator.shutdown().await;
    tracing::info!("shutdown complete");
    0
}

/// First signal: graceful shutdown. Second signal: immediate exit(1).
fn install_signal_handlers(emulator: &Emulator) {
    let orchestrator = emulator.orchestrator().clone();
    tokio::spawn(async move {
        let mut signals = SignalStream::install();
        let mut seen = 0u32;
        loop {
            signals.recv().await;
            seen += 1;
            if seen == 1 {
                tracing::info!("signal received, shutting down gracefully");
                orchestrator.request_shutdown();
            } else {
                eprintln!("forced exit");
                std::process::exit(1);
            }
        }
    });
}

#[cfg(unix)]
struct SignalStream {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalStream {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        Self {
            interrupt: signal(SignalKind::interrupt()).expect("sigint handler"),
            terminate: signal(SignalKind::terminate()).expect("sigterm handler"),
        }
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct SignalStream;

#[cfg(not(unix))]
impl SignalStream {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}
