use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::memory::Endian;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "vmpeek",
    about = "Drive a QEMU guest over QMP and page through its physical memory",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "VMPEEK_QMP_ADDR",
        value_name = "HOST:PORT",
        help = "QMP control socket address (defaults to 127.0.0.1:55555)"
    )]
    pub addr: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "VMPEEK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "VMPEEK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect, print the QMP banner and the guest run state
    Status,
    /// Pause the guest
    Pause,
    /// Resume a paused guest
    Resume,
    /// Run a human monitor command and print its reply
    Monitor(MonitorArgs),
    /// Fetch one window of physical memory and print it
    Dump(DumpArgs),
    /// Stream run-state, connectivity and event notifications until interrupted
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    #[arg(
        required = true,
        trailing_var_arg = true,
        value_name = "COMMAND",
        help = "Monitor command line, e.g. `info registers`"
    )]
    pub words: Vec<String>,
}

impl MonitorArgs {
    pub fn command_line(&self) -> String {
        self.words.join(" ")
    }
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    #[arg(
        long,
        short = 'a',
        value_name = "ADDR",
        default_value = "0",
        help = "Start address (decimal, 0x, 0o or 0b)"
    )]
    pub address: String,

    #[arg(
        long,
        short = 's',
        value_name = "BYTES",
        default_value = "1024",
        help = "Number of bytes to read, rounded up to whole rows"
    )]
    pub size: String,

    #[arg(long, value_enum, default_value_t = Endian::Little, help = "Byte order within each row")]
    pub endian: Endian,

    #[arg(long, value_name = "ADDR", help = "Highlight this address in the output")]
    pub find: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    #[arg(
        long = "clock",
        action = clap::ArgAction::SetTrue,
        help = "Poll the guest's virtual clock every 500ms and print each tick"
    )]
    pub clock: bool,

    #[arg(
        long = "raw",
        action = clap::ArgAction::SetTrue,
        help = "Print every frame received, unfiltered"
    )]
    pub raw: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_defaults() {
        let cli = Cli::try_parse_from(["vmpeek", "dump"]).expect("parses");
        let Command::Dump(args) = cli.command else {
            panic!("expected dump");
        };
        assert_eq!(args.address, "0");
        assert_eq!(args.size, "1024");
        assert_eq!(args.endian, Endian::Little);
        assert!(args.find.is_none());
    }

    #[test]
    fn monitor_keeps_the_whole_command_line() {
        let cli = Cli::try_parse_from(["vmpeek", "--addr", "10.0.0.5:4444", "monitor", "info", "registers"])
            .expect("parses");
        assert_eq!(cli.addr.as_deref(), Some("10.0.0.5:4444"));
        let Command::Monitor(args) = cli.command else {
            panic!("expected monitor");
        };
        assert_eq!(args.command_line(), "info registers");
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "vmpeek",
            "dump",
            "--address",
            "0x1000",
            "--endian",
            "big",
            "--log-level",
            "debug",
        ])
        .expect("parses");
        assert_eq!(cli.logging.level, LogLevel::Debug);
        let Command::Dump(args) = cli.command else {
            panic!("expected dump");
        };
        assert_eq!(args.endian, Endian::Big);
    }
}
