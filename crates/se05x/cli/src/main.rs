//! Command-line tool for exchanging APDUs with an SE05x through a proxy

use std::{
    io::{self, BufRead, Write},
    time::Duration,
};

use clap::{Parser, Subcommand, ValueEnum};
use se05x_link::SocketLink;
use se05x_t1::{ApduTransport, Checksum, OpenHandshake, Session, T1Config};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Exchange APDUs with an SE05x secure element over T=1")]
struct Cli {
    /// Address of the proxy owning the secure element
    #[arg(short, long, default_value = "127.0.0.1:8050")]
    proxy: String,

    /// Trace level output
    #[arg(short, long)]
    verbose: bool,

    /// Block checksum
    #[arg(long, value_enum, default_value_t = ChecksumArg::Crc)]
    checksum: ChecksumArg,

    /// Time to wait for each block, in milliseconds
    #[arg(long, default_value_t = 1000)]
    block_timeout_ms: u64,

    /// Open with a resynchronisation instead of a soft reset
    #[arg(long)]
    resync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChecksumArg {
    /// CRC-16
    Crc,
    /// Longitudinal redundancy check
    Lrc,
}

impl From<ChecksumArg> for Checksum {
    fn from(value: ChecksumArg) -> Self {
        match value {
            ChecksumArg::Crc => Self::Crc16,
            ChecksumArg::Lrc => Self::Lrc,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open the link and show the answer to reset
    Atr,

    /// Send one or more APDUs
    Send {
        /// APDUs as hex strings
        #[arg(required = true)]
        apdus: Vec<String>,
    },

    /// Interactive APDU shell
    Shell,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let handshake = if cli.resync {
        OpenHandshake::Resync
    } else {
        OpenHandshake::SoftReset
    };
    let config = T1Config::new()
        .with_checksum(cli.checksum.into())
        .with_block_timeout(Duration::from_millis(cli.block_timeout_ms))
        .with_handshake(handshake);

    let link = SocketLink::resolve(&cli.proxy)?;
    info!("Using proxy: {}", link.address());
    let mut session = Session::connect(link, config)?;

    match &cli.command {
        Commands::Atr => print_atr(&session),
        Commands::Send { apdus } => {
            for apdu in apdus {
                let command = parse_hex(apdu)?;
                let response = session.transmit_raw(&command)?;
                println!("{}", hex::encode_upper(&response));
            }
        }
        Commands::Shell => shell(&mut session)?,
    }

    session.close();
    Ok(())
}

/// Log filter: `RUST_LOG` directives on top of a default level picked by
/// `--verbose`
fn log_filter(verbose: bool, directives: Option<&str>) -> EnvFilter {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives.unwrap_or_default())
}

fn setup_logging(verbose: bool) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, directives.as_deref()))
        .with_ansi(true)
        .init();
}

fn parse_hex(input: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let clean: String = input.split_whitespace().collect();
    hex::decode(clean)
}

fn print_atr(session: &Session<SocketLink>) {
    let Some(atr) = session.atr() else {
        println!("No ATR received (the link was opened with a resynchronisation)");
        return;
    };
    println!("Protocol version: {}", atr.protocol_version);
    println!("Vendor ID: {}", hex::encode_upper(atr.vendor_id));
    println!("Block waiting time: {:?}", atr.block_waiting_time);
    println!("IFSC: {}", atr.ifsc);
    println!(
        "Physical layer: {:#04x}{}",
        atr.physical_layer,
        if atr.is_i2c() { " (I2C)" } else { "" }
    );
    println!("Max clock: {} kHz", atr.max_clock_khz);
    println!("Min polling time: {:?}", atr.min_polling_time);
    println!("Guard time: {:?}", atr.guard_time);
    println!("Wake-up time: {:?}", atr.wake_up_time);
    println!(
        "Historical bytes: {} ({})",
        hex::encode_upper(&atr.historical_bytes),
        String::from_utf8_lossy(&atr.historical_bytes)
    );
}

fn shell(session: &mut Session<SocketLink>) -> io::Result<()> {
    println!("APDU Shell - Enter commands in hex format or 'help' for assistance");
    println!("Example: 00A4040000");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(Ok(input)) => input,
            _ => break,
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.to_lowercase().as_str() {
            "exit" | "quit" | "q" => break,

            "help" | "?" => {
                println!("Commands:");
                println!("  <hex>     - Send APDU command");
                println!("  atr       - Display the answer to reset");
                println!("  reset     - Soft reset the secure element");
                println!("  resync    - Resynchronise the block sequence");
                println!("  end       - End the APDU session");
                println!("  stats     - Show link statistics");
                println!("  exit      - Exit the shell");
            }

            "atr" => print_atr(session),

            "reset" => match session.reset() {
                Ok(()) => println!("Reset successfully"),
                Err(e) => println!("Error resetting: {e}"),
            },

            "resync" => match session.resync() {
                Ok(()) => println!("Resynchronised"),
                Err(e) => println!("Error resynchronising: {e}"),
            },

            "end" => match session.end_apdu_session() {
                Ok(()) => println!("APDU session ended"),
                Err(e) => println!("Error ending session: {e}"),
            },

            "stats" => println!("{:#?}", session.statistics()),

            _ => match parse_hex(input) {
                Ok(command) => match session.transmit_raw(&command) {
                    Ok(response) => println!("{}", hex::encode_upper(&response)),
                    Err(e) => println!("Command failed: {e}"),
                },
                Err(_) => println!("Invalid hex input"),
            },
        }
    }

    println!("Goodbye!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_reaches_block_dumps() {
        assert_eq!(log_filter(true, None).max_level_hint(), Some(LevelFilter::TRACE));
        assert_eq!(log_filter(false, None).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_env_directives_are_kept() {
        let filter = log_filter(false, Some("se05x_t1=trace"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_hex_input() {
        assert_eq!(parse_hex("00 A4 04 00").unwrap(), [0x00, 0xA4, 0x04, 0x00]);
        assert!(parse_hex("0").is_err());
    }
}
