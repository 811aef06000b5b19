use crate::cli::{ArchChoice, Cli};
use crate::engine::RunLimits;
use crate::hooks::StatusPolicy;
use crate::session::SessionConfig;
use anyhow::{Result, bail};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Arm,
    X86,
    X86_64,
}

impl From<ArchChoice> for Architecture {
    fn from(choice: ArchChoice) -> Self {
        match choice {
            ArchChoice::Arm => Architecture::Arm,
            ArchChoice::X86 => Architecture::X86,
            ArchChoice::X8664 => Architecture::X86_64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub image: PathBuf,
    pub architecture: Architecture,
    pub base: u64,
    pub mem_size: u64,
    pub begin: Option<u64>,
    pub end: Option<u64>,
    pub session: SessionConfig,
    pub limits: RunLimits,
    pub log_level: String,
    pub trace_file: Option<PathBuf>,
    pub dry_run: bool,
}

impl HarnessConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.data_regs.is_empty() && cli.status_regs.is_empty() {
            bail!("at least one --data-reg or --status-reg is required");
        }
        if cli.timeout == Some(0) || cli.count == Some(0) {
            bail!("--timeout and --count must be greater than zero; omit them for an unbounded run");
        }

        let session = SessionConfig {
            region_dir: cli.region_dir.clone(),
            region_name: cli.region_name.clone(),
            data_registers: cli.data_regs.clone(),
            status_registers: cli.status_regs.clone(),
            status: StatusPolicy {
                halt_mask: cli.halt_mask,
                error_mask: cli.error_mask,
                ack_timeout: cli.ack_timeout.map(Duration::from_millis),
            },
            unlink_on_cleanup: !cli.no_unlink,
        };

        Ok(Self {
            image: cli.image.clone(),
            architecture: Architecture::from(cli.arch),
            base: cli.base,
            mem_size: cli.mem_size,
            begin: cli.begin,
            end: cli.end,
            session,
            limits: RunLimits {
                timeout: cli.timeout.map(Duration::from_millis),
                instruction_count: cli.count,
            },
            log_level: cli.log_level.clone(),
            trace_file: cli.trace_file.clone(),
            dry_run: cli.dry_run,
        })
    }

    /// End of an image of `image_len` bytes loaded at `base`, which must fit
    /// below `mem_size`.
    pub fn image_end(&self, image_len: usize) -> Result<u64> {
        let Some(end) = self.base.checked_add(image_len as u64) else {
            bail!("image of {image_len} bytes at {:#x} overflows the address space", self.base);
        };
        if end > self.mem_size {
            bail!("image does not fit below --mem-size {:#x}", self.mem_size);
        }
        Ok(end)
    }

    /// Run range `[begin, end)` for an image of `image_len` bytes.
    pub fn run_range(&self, image_len: usize) -> Result<(u64, u64)> {
        let begin = self.begin.unwrap_or(self.base);
        let end = match self.end {
            Some(end) => end,
            None => self.image_end(image_len)?,
        };
        Ok((begin, end))
    }
}
