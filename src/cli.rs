use clap::{builder::ValueHint, Parser, ValueEnum};
use std::path::PathBuf;

use crate::regmap::AddressRange;

#[derive(Parser, Debug)]
#[command(name = "regtap", about = "Run a guest image under Unicorn and tap writes to memory-mapped registers")]
pub struct Cli {
    /// Raw guest image, loaded verbatim at --base
    #[arg(value_name = "IMAGE", value_hint = ValueHint::FilePath)]
    pub image: PathBuf,

    /// Guest architecture
    #[arg(long, value_enum, default_value = "arm")]
    pub arch: ArchChoice,

    /// Load address of the image
    #[arg(long, value_parser = parse_u64, default_value = "0x1000")]
    pub base: u64,

    /// Bytes of guest memory mapped from address 0 (page multiple)
    #[arg(long, value_parser = parse_u64, default_value = "0x10000")]
    pub mem_size: u64,

    /// First address to execute (defaults to --base)
    #[arg(long, value_parser = parse_u64)]
    pub begin: Option<u64>,

    /// Stop when execution reaches this address (defaults to the end of the image)
    #[arg(long, value_parser = parse_u64)]
    pub end: Option<u64>,

    /// Data register address or inclusive range (ADDR or ADDR-END); repeatable
    #[arg(long = "data-reg", value_name = "ADDR[-END]", value_parser = parse_range)]
    pub data_regs: Vec<AddressRange>,

    /// Status register address or inclusive range (ADDR or ADDR-END); repeatable
    #[arg(long = "status-reg", value_name = "ADDR[-END]", value_parser = parse_range)]
    pub status_regs: Vec<AddressRange>,

    /// Name of the shared region to attach
    #[arg(long, default_value = crate::region::DEFAULT_REGION_NAME)]
    pub region_name: String,

    /// Directory holding shared regions
    #[arg(long, value_hint = ValueHint::DirPath, default_value = crate::region::DEFAULT_REGION_DIR)]
    pub region_dir: PathBuf,

    /// Leave the shared region in place on exit (for sessions that do not own it)
    #[arg(long)]
    pub no_unlink: bool,

    /// Maximum milliseconds before emulation aborts
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum instruction count before the emulation stops
    #[arg(long)]
    pub count: Option<u64>,

    /// Status bits that halt the run
    #[arg(long, value_parser = parse_u64, default_value = "0")]
    pub halt_mask: u64,

    /// Status bits that fail the run
    #[arg(long, value_parser = parse_u64, default_value = "0")]
    pub error_mask: u64,

    /// Milliseconds a halt waits for the observer to acknowledge it
    #[arg(long)]
    pub ack_timeout: Option<u64>,

    /// Logging verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Path to write JSON-lines observations. If omitted, observations are only logged.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub trace_file: Option<PathBuf>,

    /// Check the image, region and register layout, then exit without executing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(ValueEnum, Clone, Debug, Copy)]
pub enum ArchChoice {
    #[value(alias = "arm32")]
    Arm,
    #[value(alias = "ia32")]
    X86,
    #[value(alias = "x64", alias = "x86_64")]
    X8664,
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

/// Parse `ADDR` or `ADDR-END` (inclusive).
pub fn parse_range(s: &str) -> Result<AddressRange, String> {
    match s.split_once('-') {
        Some((begin, end)) => {
            let begin = parse_u64(begin)?;
            let end = parse_u64(end)?;
            if end < begin {
                return Err(format!("range {s:?} ends before it begins"));
            }
            Ok(AddressRange { begin, end })
        }
        None => parse_u64(s).map(AddressRange::single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert_eq!(parse_u64("0x1_0000"), Ok(0x10000));
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn ranges_parse() {
        assert_eq!(parse_range("0x1000"), Ok(AddressRange::single(0x1000)));
        assert_eq!(parse_range("0x1000-0x100f"), Ok(AddressRange { begin: 0x1000, end: 0x100f }));
        assert!(parse_range("0x20-0x10").is_err());
    }

    #[test]
    fn cli_collects_repeated_registers() {
        let cli = Cli::try_parse_from([
            "regtap", "guest.bin", "--data-reg", "0x1000", "--data-reg", "0x1008",
            "--status-reg", "0x1004", "--halt-mask", "0x80",
        ])
        .unwrap();
        assert_eq!(cli.data_regs.len(), 2);
        assert_eq!(cli.status_regs, vec![AddressRange::single(0x1004)]);
        assert_eq!(cli.halt_mask, 0x80);
        assert_eq!(cli.region_name, "emulator_shared_mem");
        assert!(!cli.no_unlink);
    }
}
