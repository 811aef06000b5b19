use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use unicorn_engine::unicorn_const::{Arch, HookType, MemType, Mode, Permission};
use unicorn_engine::{RegisterARM, RegisterX86, Unicorn};

use super::{Cpu, Engine, HookHandle, MemWrite, RunExit, RunLimits, WriteCallback, mask_value};
use crate::config::Architecture;
use crate::error::EngineError;

const PAGE_SIZE: u64 = 0x1000;

type HookRemover = Box<dyn FnOnce(&mut Unicorn<'static, ()>) -> Result<(), EngineError>>;

fn uc_err(context: &str, e: impl std::fmt::Debug) -> EngineError {
    EngineError::new(format!("{context}: {e:?}"))
}

/// Unicorn-backed engine with a flat, page-aligned memory map.
pub struct UnicornEngine {
    uc: Unicorn<'static, ()>,
    arch: Architecture,
    mapped: Vec<(u64, u64)>,
    hooks: HashMap<u64, HookRemover>,
    next_hook: u64,
    stop_requested: Rc<Cell<bool>>,
}

struct UnicornCpu<'u, 'a> {
    uc: &'u mut Unicorn<'a, ()>,
    arch: Architecture,
    stop: &'u Cell<bool>,
}

impl Cpu for UnicornCpu<'_, '_> {
    fn pc(&self) -> Result<u64, EngineError> {
        self.uc.pc_read().map_err(|e| uc_err("reading pc", e))
    }

    fn read_register(&self, name: &str) -> Result<u64, EngineError> {
        let id = register_id(self.arch, name).ok_or_else(|| EngineError::new(format!("unknown register {name}")))?;
        self.uc.reg_read(id).map_err(|e| uc_err(name, e))
    }

    fn request_stop(&mut self) {
        self.stop.set(true);
        if let Err(e) = self.uc.emu_stop() {
            log::warn!("emu_stop from hook failed: {:?}", e);
        }
    }
}

impl UnicornEngine {
    pub fn new(arch: Architecture) -> Result<Self, EngineError> {
        let uc = match arch {
            Architecture::Arm => Unicorn::new(Arch::ARM, Mode::ARM),
            Architecture::X86 => Unicorn::new(Arch::X86, Mode::MODE_32),
            Architecture::X86_64 => Unicorn::new(Arch::X86, Mode::MODE_64),
        }
        .map_err(|e| uc_err("creating unicorn", e))?;

        debug!("Unicorn backend prepared for {:?}", arch);
        Ok(Self {
            uc,
            arch,
            mapped: Vec::new(),
            hooks: HashMap::new(),
            next_hook: 0,
            stop_requested: Rc::new(Cell::new(false)),
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Map `size` bytes of RWX memory at `base`. Both must be page aligned.
    pub fn map(&mut self, base: u64, size: u64) -> Result<(), EngineError> {
        if base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 || size == 0 {
            return Err(EngineError::new(format!("mapping {base:#x}+{size:#x} is not page aligned")));
        }
        self.uc.mem_map(base, size as _, Permission::ALL).map_err(|e| uc_err("mapping memory", e))?;
        self.mapped.push((base, size));
        debug!("Mapped {:#010x}-{:#010x}", base, base + size);
        Ok(())
    }

    pub fn load(&mut self, address: u64, bytes: &[u8]) -> Result<(), EngineError> {
        self.uc.mem_write(address, bytes).map_err(|e| uc_err("loading image", e))
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, EngineError> {
        let mut buf = vec![0u8; len];
        self.uc.mem_read(address, &mut buf).map_err(|e| uc_err("reading memory", e))?;
        Ok(buf)
    }

    fn is_mapped(&self, begin: u64, end: u64) -> bool {
        self.mapped.iter().any(|(base, size)| *base <= begin && end < base + size)
    }
}

impl Engine for UnicornEngine {
    fn start(&mut self, begin: u64, end: u64, limits: RunLimits) -> Result<RunExit, EngineError> {
        self.stop_requested.set(false);
        let timeout_us = limits.timeout().map_or(0, |t| t.as_micros().max(1) as u64);
        let count = limits.instruction_count().unwrap_or(0);

        debug!("Starting emulation {:#x}..{:#x} ({})", begin, end, limits);
        self.uc.emu_start(begin, end, timeout_us, count as _).map_err(|e| uc_err("emulation", e))?;

        if self.stop_requested.get() {
            return Ok(RunExit::Stopped);
        }
        let pc = self.uc.pc_read().map_err(|e| uc_err("reading pc", e))?;
        if pc == end {
            Ok(RunExit::Completed)
        } else if limits.is_bounded() {
            Ok(RunExit::LimitReached)
        } else {
            Ok(RunExit::Stopped)
        }
    }

    fn read_register(&self, name: &str) -> Result<u64, EngineError> {
        let id = register_id(self.arch, name).ok_or_else(|| EngineError::new(format!("unknown register {name}")))?;
        self.uc.reg_read(id).map_err(|e| uc_err(name, e))
    }

    fn add_write_hook(&mut self, begin: u64, end: u64, callback: WriteCallback) -> Result<HookHandle, EngineError> {
        if !self.is_mapped(begin, end) {
            return Err(EngineError::new(format!("range {begin:#x}-{end:#x} is not mapped")));
        }

        let arch = self.arch;
        let stop = Rc::clone(&self.stop_requested);
        let mut callback = callback;
        let hook_callback = move |uc: &mut Unicorn<'_, ()>, _mem_type: MemType, address: u64, size: usize, value: i64| -> bool {
            let mut cpu = UnicornCpu { uc, arch, stop: &stop };
            let write = MemWrite { address, size, value: mask_value(value as u64, size) };
            callback(&mut cpu, &write);
            true
        };
        let id = self
            .uc
            .add_mem_hook(HookType::MEM_WRITE, begin, end, hook_callback)
            .map_err(|e| uc_err("adding write hook", e))?;

        self.next_hook += 1;
        let token = self.next_hook;
        self.hooks.insert(token, Box::new(move |uc: &mut Unicorn<'static, ()>| uc.remove_hook(id).map_err(|e| uc_err("removing hook", e))));
        Ok(HookHandle::new(token))
    }

    fn remove_hook(&mut self, hook: HookHandle) -> Result<(), EngineError> {
        let remover = self
            .hooks
            .remove(&hook.raw())
            .ok_or_else(|| EngineError::new(format!("{hook} is not installed")))?;
        remover(&mut self.uc)
    }
}

fn register_id(arch: Architecture, name: &str) -> Option<i32> {
    let name = name.to_ascii_lowercase();
    match arch {
        Architecture::Arm => {
            let reg = match name.as_str() {
                "r0" => RegisterARM::R0,
                "r1" => RegisterARM::R1,
                "r2" => RegisterARM::R2,
                "r3" => RegisterARM::R3,
                "r4" => RegisterARM::R4,
                "r5" => RegisterARM::R5,
                "r6" => RegisterARM::R6,
                "r7" => RegisterARM::R7,
                "r8" => RegisterARM::R8,
                "r9" => RegisterARM::R9,
                "r10" => RegisterARM::R10,
                "r11" | "fp" => RegisterARM::R11,
                "r12" | "ip" => RegisterARM::R12,
                "r13" | "sp" => RegisterARM::SP,
                "r14" | "lr" => RegisterARM::LR,
                "r15" | "pc" => RegisterARM::PC,
                "cpsr" => RegisterARM::CPSR,
                _ => return None,
            };
            Some(reg.into())
        }
        Architecture::X86 | Architecture::X86_64 => {
            let reg = match name.as_str() {
                "eax" => RegisterX86::EAX,
                "ebx" => RegisterX86::EBX,
                "ecx" => RegisterX86::ECX,
                "edx" => RegisterX86::EDX,
                "esi" => RegisterX86::ESI,
                "edi" => RegisterX86::EDI,
                "ebp" => RegisterX86::EBP,
                "esp" => RegisterX86::ESP,
                "eip" => RegisterX86::EIP,
                "rax" if arch == Architecture::X86_64 => RegisterX86::RAX,
                "rbx" if arch == Architecture::X86_64 => RegisterX86::RBX,
                "rcx" if arch == Architecture::X86_64 => RegisterX86::RCX,
                "rdx" if arch == Architecture::X86_64 => RegisterX86::RDX,
                "rsi" if arch == Architecture::X86_64 => RegisterX86::RSI,
                "rdi" if arch == Architecture::X86_64 => RegisterX86::RDI,
                "rbp" if arch == Architecture::X86_64 => RegisterX86::RBP,
                "rsp" if arch == Architecture::X86_64 => RegisterX86::RSP,
                "r8" if arch == Architecture::X86_64 => RegisterX86::R8,
                "r9" if arch == Architecture::X86_64 => RegisterX86::R9,
                "rip" if arch == Architecture::X86_64 => RegisterX86::RIP,
                "pc" if arch == Architecture::X86_64 => RegisterX86::RIP,
                "pc" => RegisterX86::EIP,
                _ => return None,
            };
            Some(reg.into())
        }
    }
}
