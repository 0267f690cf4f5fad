//! Netlab CLI - run lesson code against the virtual network
//!
//! Usage:
//!   netlab run       - Run a guest module and print its result
//!   netlab variants  - List lesson variants and the host functions they expose

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use netlab_sandbox::{LengthPrefixed, Orchestrator, Outcome, Payload, SandboxConfig, Variant};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "netlab")]
#[command(version)]
#[command(about = "Runs networking playground lessons in a WebAssembly sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a guest module
    Run {
        /// Guest module (.wasm or .wat)
        #[arg(long)]
        guest: PathBuf,

        /// Virtual network module, required by the full variant
        #[arg(long)]
        network: Option<PathBuf>,

        /// Which lesson the guest belongs to
        #[arg(long, value_enum, default_value_t = Lesson::Full)]
        variant: Lesson,

        /// JSON sandbox configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// List lesson variants
    Variants,
}

#[derive(Clone, Copy, ValueEnum)]
enum Lesson {
    /// Sockets, polling and error reporting
    Full,
    /// Build a 20-byte IPv4 header
    IpHeader,
    /// Build a 28-byte IPv4 + UDP datagram
    UdpDatagram,
}

impl Lesson {
    fn variant(self) -> Variant {
        match self {
            Lesson::Full => Variant::full_networking(LengthPrefixed),
            Lesson::IpHeader => Variant::ip_header(),
            Lesson::UdpDatagram => Variant::udp_datagram(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            guest,
            network,
            variant,
            config,
            json,
        } => {
            let config = match config {
                Some(path) => SandboxConfig::from_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => SandboxConfig::default(),
            };
            let variant = variant.variant();
            let mut orchestrator = Orchestrator::new(config)?;

            if let Some(path) = network {
                let wasm = std::fs::read(&path)
                    .with_context(|| format!("reading network module {}", path.display()))?;
                orchestrator.attach_network(wasm).await?;
                info!(network = %path.display(), "network module loaded");
            }

            let wasm = std::fs::read(&guest)
                .with_context(|| format!("reading guest module {}", guest.display()))?;
            info!(guest = %guest.display(), variant = variant.name(), "running guest");
            let outcome = orchestrator.run(&variant, wasm).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            match outcome {
                Outcome::Succeeded(payload) => {
                    info!(bytes = payload.bytes().len(), "guest run finished");
                    if !json {
                        print_payload(&payload);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Outcome::Failed(message) => {
                    warn!(variant = variant.name(), "guest run failed");
                    if !json {
                        eprintln!("error: {}", message);
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Variants => {
            for lesson in Lesson::value_variants() {
                let variant = lesson.variant();
                let imports: Vec<_> = variant
                    .capabilities()
                    .iter()
                    .map(|cap| cap.import_name())
                    .collect();
                println!("{:<16} {:?}", variant.name(), variant.result());
                println!("  env: {}", imports.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_payload(payload: &Payload) {
    let bytes = payload.bytes();
    for chunk in bytes.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{}", hex.join(" "));
    }
    println!("({} bytes)", bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments_select_variant() {
        let cli = Cli::parse_from(["netlab", "run", "--guest", "lesson.wasm", "--variant", "ip-header"]);
        let Commands::Run { guest, network, variant, json, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(guest, PathBuf::from("lesson.wasm"));
        assert!(network.is_none());
        assert!(!json);
        assert_eq!(variant.variant().name(), "ip-header");
    }

    #[test]
    fn test_full_variant_is_default() {
        let cli = Cli::parse_from(["netlab", "run", "--guest", "g.wat", "--network", "net.wasm"]);
        let Commands::Run { variant, network, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(variant.variant().name(), "full-networking");
        assert_eq!(network, Some(PathBuf::from("net.wasm")));
    }
}
