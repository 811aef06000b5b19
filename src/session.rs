//! Emulation session: the lifecycle around one bounded run.
//!
//! ```text
//! Initialized --install()--> HooksInstalled --run()--> Running --> Stopped
//!                                                          \-----> Failed
//! ```
//!
//! A session exists only once its shared region is attached and its
//! register map is valid. `cleanup()` removes every hook and releases the
//! region; it runs at most once, runs automatically when `run()` fails, and
//! runs on drop for sessions that were never cleaned up explicitly.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, error, info, warn};

use crate::board::Board;
use crate::engine::{Engine, RunExit, RunLimits};
use crate::error::{Error, Result};
use crate::hooks::dispatch::{Dispatcher, StatusEvent, StatusPolicy};
use crate::hooks::registry::HookRegistry;
use crate::region::{DEFAULT_REGION_DIR, DEFAULT_REGION_NAME, RegionState, SharedRegion};
use crate::regmap::{AddressRange, RegisterMap};
use crate::sink::{BoardSink, FanOut, LogSink, ObservationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    HooksInstalled,
    Running,
    Stopped,
    Failed,
}

impl SessionState {
    /// Code published in the board `STATE` word.
    pub fn code(self) -> u32 {
        match self {
            SessionState::Initialized => 1,
            SessionState::HooksInstalled => 2,
            SessionState::Running => 3,
            SessionState::Stopped => 4,
            SessionState::Failed => 5,
        }
    }
}

/// Board `STATE` code once a session has released its resources.
pub const STATE_RELEASED: u32 = 6;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub region_dir: PathBuf,
    pub region_name: String,
    pub data_registers: Vec<AddressRange>,
    pub status_registers: Vec<AddressRange>,
    pub status: StatusPolicy,
    /// Only the owning session destroys the region on cleanup.
    pub unlink_on_cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            region_dir: PathBuf::from(DEFAULT_REGION_DIR),
            region_name: DEFAULT_REGION_NAME.to_string(),
            data_registers: Vec::new(),
            status_registers: Vec::new(),
            status: StatusPolicy::default(),
            unlink_on_cleanup: true,
        }
    }
}

/// What a successful run looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub exit: RunExit,
    pub event: Option<StatusEvent>,
    pub observations: u64,
}

pub struct Session<E: Engine> {
    engine: E,
    state: SessionState,
    registers: RegisterMap,
    registry: HookRegistry,
    region: Rc<RefCell<SharedRegion>>,
    dispatcher: Dispatcher,
    unlink_on_cleanup: bool,
    cleaned: bool,
}

impl<E: Engine> Session<E> {
    /// Attach the shared region and build the register map.
    ///
    /// Either step failing is fatal: no session is returned and nothing is
    /// left installed in `engine`. Observations go to `sink` in addition to
    /// the log and the shared-region board.
    pub fn new(engine: E, config: SessionConfig, sink: impl ObservationSink + 'static) -> Result<Self> {
        let region = SharedRegion::open(&config.region_dir, &config.region_name)?;
        Board::attach(&region)?.reset_controls();
        let registers = RegisterMap::new(&config.data_registers, &config.status_registers)?;
        if registers.is_empty() {
            warn!("No data or status registers configured");
        }

        let region = Rc::new(RefCell::new(region));
        let fan_out = FanOut::new()
            .with(LogSink)
            .with(sink)
            .with(BoardSink::new(Rc::clone(&region)));
        let dispatcher = Dispatcher::new(Box::new(fan_out), config.status, Some(Rc::clone(&region)));

        info!(
            "Session ready: {} data / {} status register(s), region {}",
            registers.count(crate::regmap::Role::Data),
            registers.count(crate::regmap::Role::Status),
            config.region_name
        );

        let session = Self {
            engine,
            state: SessionState::Initialized,
            registers,
            registry: HookRegistry::new(),
            region,
            dispatcher,
            unlink_on_cleanup: config.unlink_on_cleanup,
            cleaned: false,
        };
        session.publish_state(SessionState::Initialized.code());
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn region_state(&self) -> RegionState {
        self.region.borrow().state()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Writes dispatched so far.
    pub fn observations(&self) -> u64 {
        self.dispatcher.dispatched()
    }

    fn require(&self, operation: &'static str, expected: SessionState) -> Result<()> {
        if self.cleaned || self.state != expected {
            return Err(Error::InvalidState { operation, state: self.state });
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
        self.publish_state(next.code());
    }

    fn publish_state(&self, code: u32) {
        let region = self.region.borrow();
        if region.is_open()
            && let Ok(board) = Board::view(&region)
        {
            board.set_state(code);
        }
    }

    /// Install one write hook per configured register.
    pub fn install(&mut self) -> Result<usize> {
        self.require("install hooks", SessionState::Initialized)?;
        let dispatcher = &self.dispatcher;
        let count = self
            .registry
            .install(&mut self.engine, self.registers.descriptors().copied(), |d| dispatcher.handler_for(d))?;
        self.transition(SessionState::HooksInstalled);
        info!("Installed {} register hook(s)", count);
        Ok(count)
    }

    /// Run the engine over `[begin, end)`.
    ///
    /// On any failure the session moves to `Failed`, cleans up, and only
    /// then returns the error. If that cleanup fails too, both are returned
    /// as [`Error::CleanupAfterFailure`].
    pub fn run(&mut self, begin: u64, end: u64, limits: RunLimits) -> Result<RunSummary> {
        self.require("run", SessionState::HooksInstalled)?;
        if end <= begin {
            return Err(Error::InvalidRange { begin, end });
        }

        self.transition(SessionState::Running);
        info!("Emulating {:#x}..{:#x} ({})", begin, end, limits);
        let result = self.engine.start(begin, end, limits);
        let event = self.dispatcher.take_event();

        let exit = match result {
            Err(e) => return self.fail(Error::EngineFailure(e.to_string())),
            Ok(RunExit::LimitReached) => return self.fail(Error::RunLimitExceeded(limits.to_string())),
            Ok(exit) => exit,
        };
        if let Some(StatusEvent::ErrorFlag { sequence, value }) = event {
            return self.fail(Error::EngineFailure(format!(
                "guest raised error status {value:#x} (write #{sequence})"
            )));
        }

        self.transition(SessionState::Stopped);
        let summary = RunSummary { exit, event, observations: self.dispatcher.dispatched() };
        info!("Emulation stopped ({:?}) after {} register write(s)", exit, summary.observations);
        Ok(summary)
    }

    fn fail(&mut self, err: Error) -> Result<RunSummary> {
        error!("{}", err);
        self.transition(SessionState::Failed);
        match self.cleanup() {
            Ok(()) => Err(err),
            Err(cleanup) => {
                error!("Cleanup after failure: {}", cleanup);
                Err(Error::CleanupAfterFailure { error: Box::new(err), cleanup: Box::new(cleanup) })
            }
        }
    }

    /// Remove all hooks and release the shared region.
    ///
    /// Safe from every state; only the first call does anything. Hook
    /// removal failures never keep the region from being released; all
    /// failures are reported together.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;

        let mut errors = Vec::new();
        if let Err(e) = self.registry.remove_all(&mut self.engine) {
            errors.push(e);
        }

        let mut region = self.region.borrow_mut();
        if region.is_open()
            && let Ok(board) = Board::view(&region)
        {
            board.set_state(STATE_RELEASED);
        }
        region.close();
        if self.state != SessionState::Initialized && self.unlink_on_cleanup {
            if let Err(e) = region.unlink() {
                errors.push(e);
            }
        }
        drop(region);

        info!("Session cleaned up from {:?}", self.state);
        Error::aggregate(errors)
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        if !self.cleaned {
            debug!("Session dropped in {:?} without cleanup", self.state);
            if let Err(e) = self.cleanup() {
                error!("Cleanup on drop failed: {}", e);
            }
        }
    }
}
