//! Scripted in-process engine.
//!
//! Instead of decoding instructions, `SimEngine` replays a list of guest
//! writes. Each step sets the program counter, then fires every hook whose
//! range covers the written address, in installation order. Failures can be
//! injected at hook installation, hook removal and during a run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use log::trace;

use super::{Cpu, Engine, HookHandle, MemWrite, RunExit, RunLimits, WriteCallback, mask_value};
use crate::error::EngineError;

/// One guest store: the instruction at `pc` writes `value` to `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptStep {
    pub pc: u64,
    pub address: u64,
    pub value: u64,
    pub size: usize,
}

impl ScriptStep {
    pub fn word(pc: u64, address: u64, value: u64) -> Self {
        Self { pc, address, value, size: 4 }
    }
}

struct SimHook {
    begin: u64,
    end: u64,
    callback: WriteCallback,
}

#[derive(Default)]
pub struct SimEngine {
    script: Vec<ScriptStep>,
    registers: HashMap<String, u64>,
    hooks: BTreeMap<u64, SimHook>,
    next_hook: u64,
    unmapped: Vec<(u64, u64)>,
    stuck: HashSet<u64>,
    fail_at: Option<(usize, String)>,
    step_delay: Option<Duration>,
    executed: u64,
}

struct SimCpu<'a> {
    registers: &'a HashMap<String, u64>,
    stop: bool,
}

impl Cpu for SimCpu<'_> {
    fn pc(&self) -> Result<u64, EngineError> {
        self.read_register("pc")
    }

    fn read_register(&self, name: &str) -> Result<u64, EngineError> {
        self.registers
            .get(&name.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| EngineError::new(format!("unknown register {name}")))
    }

    fn request_stop(&mut self) {
        self.stop = true;
    }
}

impl SimEngine {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        let mut registers = HashMap::new();
        registers.insert("pc".to_string(), 0);
        Self { script, registers, ..Self::default() }
    }

    pub fn with_register(mut self, name: &str, value: u64) -> Self {
        self.registers.insert(name.to_ascii_lowercase(), value);
        self
    }

    /// Refuse hooks touching `[begin, end]`, as an engine does for unmapped memory.
    pub fn with_unmapped(mut self, begin: u64, end: u64) -> Self {
        self.unmapped.push((begin, end));
        self
    }

    /// Make removal of any hook whose range covers `address` fail.
    pub fn with_stuck_hook(mut self, address: u64) -> Self {
        self.stuck.insert(address);
        self
    }

    /// Abort the run with `msg` before executing step `index`.
    pub fn with_failure_at(mut self, index: usize, msg: &str) -> Self {
        self.fail_at = Some((index, msg.to_string()));
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Number of hooks currently installed in the engine.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn has_hook_at(&self, address: u64) -> bool {
        self.hooks.values().any(|h| h.begin <= address && address <= h.end)
    }

    /// Steps executed across all runs.
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl Engine for SimEngine {
    fn start(&mut self, begin: u64, end: u64, limits: RunLimits) -> Result<RunExit, EngineError> {
        let started = Instant::now();
        let mut count = 0u64;

        let steps: Vec<(usize, ScriptStep)> = self
            .script
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, s)| begin <= s.pc && s.pc < end)
            .collect();

        for (index, step) in steps {
            if let Some(max) = limits.instruction_count() && count >= max {
                return Ok(RunExit::LimitReached);
            }
            if let Some(timeout) = limits.timeout() && started.elapsed() >= timeout {
                return Ok(RunExit::LimitReached);
            }
            if let Some((at, msg)) = &self.fail_at && *at == index {
                return Err(EngineError::new(msg.clone()));
            }
            if let Some(delay) = self.step_delay {
                std::thread::sleep(delay);
            }

            self.registers.insert("pc".to_string(), step.pc);
            count += 1;
            self.executed += 1;

            let write = MemWrite { address: step.address, size: step.size, value: mask_value(step.value, step.size) };
            trace!("sim step {} pc={:#x} write {:#x} <- {:#x}", index, step.pc, write.address, write.value);

            let mut cpu = SimCpu { registers: &self.registers, stop: false };
            for hook in self.hooks.values_mut() {
                if hook.begin <= write.address && write.address <= hook.end {
                    (hook.callback)(&mut cpu, &write);
                }
            }
            if cpu.stop {
                return Ok(RunExit::Stopped);
            }
        }

        self.registers.insert("pc".to_string(), end);
        Ok(RunExit::Completed)
    }

    fn read_register(&self, name: &str) -> Result<u64, EngineError> {
        SimCpu { registers: &self.registers, stop: false }.read_register(name)
    }

    fn add_write_hook(&mut self, begin: u64, end: u64, callback: WriteCallback) -> Result<HookHandle, EngineError> {
        if let Some((a, b)) = self.unmapped.iter().find(|(a, b)| begin <= *b && *a <= end) {
            return Err(EngineError::new(format!("range {begin:#x}-{end:#x} overlaps unmapped {a:#x}-{b:#x}")));
        }
        self.next_hook += 1;
        let id = self.next_hook;
        self.hooks.insert(id, SimHook { begin, end, callback });
        Ok(HookHandle::new(id))
    }

    fn remove_hook(&mut self, hook: HookHandle) -> Result<(), EngineError> {
        let Some(entry) = self.hooks.get(&hook.raw()) else {
            return Err(EngineError::new(format!("{hook} is not installed")));
        };
        if self.stuck.iter().any(|a| entry.begin <= *a && *a <= entry.end) {
            return Err(EngineError::new(format!("{hook} could not be removed")));
        }
        self.hooks.remove(&hook.raw());
        Ok(())
    }
}
