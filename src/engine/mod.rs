//! Boundary to the instruction-set emulation engine.
//!
//! The harness only needs four things from an engine: run a range, read a
//! named CPU register, watch memory writes over an address range, and stop
//! watching again. Hook callbacks run synchronously on the emulation stream
//! and see the CPU through [`Cpu`].

use std::fmt;
use std::time::Duration;

use crate::error::EngineError;

pub mod sim;
#[cfg(feature = "unicorn")]
pub mod unicorn;

pub use sim::{ScriptStep, SimEngine};
#[cfg(feature = "unicorn")]
pub use self::unicorn::UnicornEngine;

/// Engine-issued token for an installed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

impl HookHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// A guest memory write that matched a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemWrite {
    pub address: u64,
    pub size: usize,
    pub value: u64,
}

/// CPU state visible from inside a hook callback.
pub trait Cpu {
    fn pc(&self) -> Result<u64, EngineError>;
    fn read_register(&self, name: &str) -> Result<u64, EngineError>;
    /// Ask the engine to return from the current run after this callback.
    fn request_stop(&mut self);
}

pub type WriteCallback = Box<dyn FnMut(&mut dyn Cpu, &MemWrite)>;

/// Bounds on a single run. `None` means unbounded; so does a zero bound,
/// which is how Unicorn reads it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Option<Duration>,
    pub instruction_count: Option<u64>,
}

impl RunLimits {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    pub fn instruction_count(&self) -> Option<u64> {
        self.instruction_count.filter(|n| *n > 0)
    }

    pub fn is_bounded(&self) -> bool {
        self.timeout().is_some() || self.instruction_count().is_some()
    }
}

impl fmt::Display for RunLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.timeout(), self.instruction_count()) {
            (Some(t), Some(n)) => write!(f, "{}ms / {} instructions", t.as_millis(), n),
            (Some(t), None) => write!(f, "{}ms", t.as_millis()),
            (None, Some(n)) => write!(f, "{} instructions", n),
            (None, None) => f.write_str("unbounded"),
        }
    }
}

/// How a run that did not error came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Execution reached the end address.
    Completed,
    /// A hook or the host asked the engine to stop.
    Stopped,
    /// A timeout or instruction-count bound cut the run short.
    LimitReached,
}

pub trait Engine {
    /// Execute from `begin` until `end` is reached, a limit trips, or a stop is requested.
    fn start(&mut self, begin: u64, end: u64, limits: RunLimits) -> Result<RunExit, EngineError>;

    fn read_register(&self, name: &str) -> Result<u64, EngineError>;

    /// Invoke `callback` for every write that touches `[begin, end]`.
    fn add_write_hook(&mut self, begin: u64, end: u64, callback: WriteCallback) -> Result<HookHandle, EngineError>;

    fn remove_hook(&mut self, hook: HookHandle) -> Result<(), EngineError>;
}

/// Keep only the bytes a write of `size` actually stored.
pub(crate) fn mask_value(value: u64, size: usize) -> u64 {
    match size {
        0 => 0,
        1..=7 => value & ((1u64 << (size * 8)) - 1),
        _ => value,
    }
}
