//! CLI for GDB Remote Serial Protocol stubs.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod target;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rsp::{Client, Config, Endpoint};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rsp", version, about = "Talk to a GDB remote stub")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Stub address: HOST:PORT or unix:PATH.
    #[arg(short, long, default_value = "localhost:1234", global = true)]
    addr: Endpoint,

    /// Transmissions per packet before giving up.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..), global = true)]
    attempts: u32,

    /// Milliseconds to wait for the stub to acknowledge a packet.
    #[arg(long, default_value_t = 2000, global = true)]
    ack_timeout_ms: u64,

    /// Output format.
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Log protocol traffic to stderr (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Target(TargetCommand),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Subcommands that talk to the stub.
#[derive(Subcommand)]
enum TargetCommand {
    /// Read target memory.
    ReadMemory {
        /// Start address (hex or decimal).
        #[arg(value_parser = parse_int)]
        address: u64,
        /// Length in bytes.
        #[arg(value_parser = parse_int)]
        length: u64,
    },

    /// Write hex-encoded bytes to target memory.
    WriteMemory {
        /// Start address (hex or decimal).
        #[arg(value_parser = parse_int)]
        address: u64,
        /// Bytes as a hex string, e.g. `deadbeef`.
        data: String,
    },

    /// Dump the general register block.
    Registers,

    /// Read one register.
    Register {
        /// Register number as defined by the target architecture.
        number: u32,
    },

    /// Write one register.
    SetRegister {
        /// Register number as defined by the target architecture.
        number: u32,
        /// Value as hex bytes in target order.
        value: String,
    },

    /// Report why the target is halted.
    HaltReason,

    /// Resume the target and wait until it stops. Ctrl-C interrupts it.
    #[command(visible_alias = "c")]
    Continue {
        /// Resume at this address instead of the current PC.
        #[arg(long, value_parser = parse_int)]
        at: Option<u64>,
    },

    /// Execute a single instruction.
    #[command(visible_alias = "s")]
    Step {
        /// Step from this address instead of the current PC.
        #[arg(long, value_parser = parse_int)]
        at: Option<u64>,
    },

    /// Stop a running target.
    Interrupt,

    /// Detach from the target and let it run.
    Detach,
}

/// Output format for replies.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable text.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("rsp: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        let command = match self.command {
            Command::Target(command) => command,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "rsp", &mut std::io::stdout());
                return Ok(());
            }
        };

        let mut config = Config::default();
        config.max_attempts = self.attempts;
        config.ack_timeout = Duration::from_millis(self.ack_timeout_ms);

        let mut client = Client::new(self.addr, config);
        client
            .connect()
            .await
            .with_context(|| format!("cannot reach stub at {}", client.endpoint()))?;

        let outcome = command.run(&mut client, self.format).await;
        client.disconnect().await?;
        outcome
    }
}

impl TargetCommand {
    async fn run(self, client: &mut Client, format: OutputFormat) -> Result<()> {
        match self {
            Self::ReadMemory { address, length } => {
                target::read_memory(client, address, length, format).await
            }
            Self::WriteMemory { address, data } => {
                target::write_memory(client, address, &data).await
            }
            Self::Registers => target::registers(client, format).await,
            Self::Register { number } => target::register(client, number, format).await,
            Self::SetRegister { number, value } => {
                target::set_register(client, number, &value).await
            }
            Self::HaltReason => target::halt_reason(client, format).await,
            Self::Continue { at } => target::resume(client, at, format).await,
            Self::Step { at } => target::step(client, at, format).await,
            Self::Interrupt => target::interrupt(client, format).await,
            Self::Detach => target::detach(client).await,
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_int(s: &str) -> Result<u64, String> {
    if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex_str, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ints() {
        assert_eq!(parse_int("10").unwrap(), 10);
        assert_eq!(parse_int("0x10").unwrap(), 16);
        assert_eq!(parse_int("0X2000000").unwrap(), 0x0200_0000);
        assert!(parse_int("invalid").is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_options() {
        let cli = Cli::try_parse_from([
            "rsp",
            "read-memory",
            "0x2000000",
            "16",
            "--addr",
            "unix:/tmp/stub.sock",
            "--attempts",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.attempts, 3);
        assert_eq!(cli.addr.to_string(), "unix:/tmp/stub.sock");
        assert!(matches!(
            cli.command,
            Command::Target(TargetCommand::ReadMemory {
                address: 0x0200_0000,
                length: 16
            })
        ));
    }

    #[test]
    fn completion_is_not_a_target_command() {
        let cli = Cli::try_parse_from(["rsp", "completion", "bash"]).unwrap();
        assert!(matches!(cli.command, Command::Completion { shell: Shell::Bash }));
    }

    #[test]
    fn rejects_zero_attempts() {
        assert!(Cli::try_parse_from(["rsp", "halt-reason", "--attempts", "0"]).is_err());
    }
}
