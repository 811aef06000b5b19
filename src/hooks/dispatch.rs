//! Callback bodies run by the engine on a matching register write.
//!
//! Handlers run on the emulation stream: the guest CPU is paused until they
//! return. They therefore never wait without a bound, and never let an
//! error or panic escape into the engine. Anything that needs the session's
//! attention is recorded as a [`StatusEvent`] and picked up after the run.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::board::Board;
use crate::engine::{Cpu, MemWrite, WriteCallback};
use crate::error::{Error, Result};
use crate::region::SharedRegion;
use crate::regmap::{RegisterDescriptor, Role};
use crate::sink::{Observation, ObservationSink};

const ACK_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// How the status handler reacts to particular bit patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Any of these bits set requests a halt.
    pub halt_mask: u64,
    /// Any of these bits set marks the run as failed.
    pub error_mask: u64,
    /// Upper bound on waiting for the observer to acknowledge a halt.
    pub ack_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Halt { sequence: u64, value: u64, acknowledged: bool },
    ErrorFlag { sequence: u64, value: u64 },
    StopRequested { sequence: u64 },
}

struct DispatchState {
    sequence: Cell<u64>,
    sink: RefCell<Box<dyn ObservationSink>>,
    region: Option<Rc<RefCell<SharedRegion>>>,
    event: Cell<Option<StatusEvent>>,
    policy: StatusPolicy,
}

/// Produces the per-role write callbacks and collects what they saw.
pub struct Dispatcher {
    state: Rc<DispatchState>,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn ObservationSink>, policy: StatusPolicy, region: Option<Rc<RefCell<SharedRegion>>>) -> Self {
        Self {
            state: Rc::new(DispatchState {
                sequence: Cell::new(0),
                sink: RefCell::new(sink),
                region,
                event: Cell::new(None),
                policy,
            }),
        }
    }

    pub fn handler_for(&self, descriptor: &RegisterDescriptor) -> WriteCallback {
        let state = Rc::clone(&self.state);
        match descriptor.role {
            Role::Data => Box::new(move |cpu, write| state.guarded(Role::Data, cpu, write)),
            Role::Status => Box::new(move |cpu, write| state.guarded(Role::Status, cpu, write)),
        }
    }

    /// Run the data-register handler directly, as the engine would.
    pub fn on_data_write(&self, cpu: &mut dyn Cpu, write: &MemWrite) {
        self.state.guarded(Role::Data, cpu, write);
    }

    /// Run the status-register handler directly, as the engine would.
    pub fn on_status_write(&self, cpu: &mut dyn Cpu, write: &MemWrite) {
        self.state.guarded(Role::Status, cpu, write);
    }

    /// Number of writes dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.state.sequence.get()
    }

    pub fn take_event(&self) -> Option<StatusEvent> {
        self.state.event.take()
    }

    pub fn policy(&self) -> StatusPolicy {
        self.state.policy
    }
}

impl DispatchState {
    fn guarded(&self, role: Role, cpu: &mut dyn Cpu, write: &MemWrite) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match role {
            Role::Data => self.data_write(cpu, write),
            Role::Status => self.status_write(cpu, write),
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} handler failed at {:#x}: {}", role, write.address, e),
            Err(_) => error!("{} handler panicked at {:#x}", role, write.address),
        }
    }

    fn observe(&self, role: Role, cpu: &dyn Cpu, write: &MemWrite) -> Result<Observation> {
        let pc = cpu.pc().map_err(|e| Error::EngineFailure(e.to_string()))?;
        let sequence = self.sequence.get() + 1;
        self.sequence.set(sequence);
        let obs = Observation { sequence, role, address: write.address, pc, value: write.value, size: write.size };
        if let Err(e) = self.sink.borrow_mut().record(&obs) {
            warn!("Dropping observation #{}: {}", sequence, e);
        }
        Ok(obs)
    }

    fn data_write(&self, cpu: &mut dyn Cpu, write: &MemWrite) -> Result<()> {
        let obs = self.observe(Role::Data, cpu, write)?;
        self.honour_stop_request(cpu, obs.sequence);
        Ok(())
    }

    fn status_write(&self, cpu: &mut dyn Cpu, write: &MemWrite) -> Result<()> {
        let obs = self.observe(Role::Status, cpu, write)?;
        let policy = self.policy;

        if obs.value & policy.error_mask != 0 {
            error!("Status register {:#x} raised error bits {:#x} at PC {:#x}", obs.address, obs.value & policy.error_mask, obs.pc);
            self.record(StatusEvent::ErrorFlag { sequence: obs.sequence, value: obs.value });
            cpu.request_stop();
            return Ok(());
        }

        if obs.value & policy.halt_mask != 0 {
            let acknowledged = self.await_ack(obs.sequence);
            info!("Status register {:#x} requested halt at PC {:#x}", obs.address, obs.pc);
            self.record(StatusEvent::Halt { sequence: obs.sequence, value: obs.value, acknowledged });
            cpu.request_stop();
            return Ok(());
        }

        self.honour_stop_request(cpu, obs.sequence);
        Ok(())
    }

    /// Poll the board for an acknowledgement of `sequence`, never past `ack_timeout`.
    fn await_ack(&self, sequence: u64) -> bool {
        let (Some(timeout), Some(region)) = (self.policy.ack_timeout, &self.region) else {
            return false;
        };
        let region = region.borrow();
        let Ok(board) = Board::view(&region) else {
            return false;
        };

        let deadline = Instant::now() + timeout;
        loop {
            if board.is_acknowledged(sequence) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("No acknowledgement for status #{} within {:?}", sequence, timeout);
                return false;
            }
            std::thread::sleep(ACK_POLL_INTERVAL);
        }
    }

    fn honour_stop_request(&self, cpu: &mut dyn Cpu, sequence: u64) {
        let Some(region) = &self.region else { return };
        let region = region.borrow();
        if let Ok(board) = Board::view(&region)
            && board.stop_requested()
        {
            info!("Observer requested stop at write #{}", sequence);
            self.record(StatusEvent::StopRequested { sequence });
            cpu.request_stop();
        }
    }

    // an error flag is never overwritten by a later, milder event
    fn record(&self, event: StatusEvent) {
        if !matches!(self.event.get(), Some(StatusEvent::ErrorFlag { .. })) {
            self.event.set(Some(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::sink::MemorySink;

    struct FakeCpu {
        pc: Option<u64>,
        stopped: bool,
    }

    impl Cpu for FakeCpu {
        fn pc(&self) -> std::result::Result<u64, EngineError> {
            self.pc.ok_or_else(|| EngineError::new("pc unavailable"))
        }

        fn read_register(&self, _name: &str) -> std::result::Result<u64, EngineError> {
            self.pc()
        }

        fn request_stop(&mut self) {
            self.stopped = true;
        }
    }

    fn cpu(pc: u64) -> FakeCpu {
        FakeCpu { pc: Some(pc), stopped: false }
    }

    fn write(address: u64, value: u64) -> MemWrite {
        MemWrite { address, size: 4, value }
    }

    fn policy() -> StatusPolicy {
        StatusPolicy { halt_mask: 0x80, error_mask: 0x40, ack_timeout: None }
    }

    #[test]
    fn data_write_produces_one_observation() {
        let mem = MemorySink::new();
        let dispatcher = Dispatcher::new(Box::new(mem.clone()), policy(), None);
        let mut cpu = cpu(0x1200);
        dispatcher.on_data_write(&mut cpu, &write(0x1000, 0x42));

        let records = mem.records();
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].pc, records[0].value, records[0].role), (0x1200, 0x42, Role::Data));
        assert_eq!(records[0].sequence, 1);
        assert!(!cpu.stopped);
        assert_eq!(dispatcher.take_event(), None);
    }

    #[test]
    fn sequence_is_shared_across_roles() {
        let mem = MemorySink::new();
        let dispatcher = Dispatcher::new(Box::new(mem.clone()), policy(), None);
        let mut cpu = cpu(0x10);
        dispatcher.on_data_write(&mut cpu, &write(0x1000, 1));
        dispatcher.on_status_write(&mut cpu, &write(0x1004, 0));
        dispatcher.on_data_write(&mut cpu, &write(0x1000, 2));
        let seqs: Vec<u64> = mem.records().iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(dispatcher.dispatched(), 3);
    }

    #[test]
    fn halt_bit_stops_engine_and_records_event() {
        let dispatcher = Dispatcher::new(Box::new(MemorySink::new()), policy(), None);
        let mut cpu = cpu(0x1300);
        dispatcher.on_status_write(&mut cpu, &write(0x1004, 0x81));
        assert!(cpu.stopped);
        assert_eq!(
            dispatcher.take_event(),
            Some(StatusEvent::Halt { sequence: 1, value: 0x81, acknowledged: false })
        );
        assert_eq!(dispatcher.take_event(), None);
    }

    #[test]
    fn error_flag_wins_over_later_halt() {
        let dispatcher = Dispatcher::new(Box::new(MemorySink::new()), policy(), None);
        let mut cpu = cpu(0x1300);
        dispatcher.on_status_write(&mut cpu, &write(0x1004, 0x40));
        dispatcher.on_status_write(&mut cpu, &write(0x1004, 0x80));
        assert_eq!(dispatcher.take_event(), Some(StatusEvent::ErrorFlag { sequence: 1, value: 0x40 }));
    }

    #[test]
    fn halt_wait_is_bounded_by_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let region = Rc::new(RefCell::new(SharedRegion::create(dir.path(), "d", 4096).unwrap()));
        Board::attach(&region.borrow()).unwrap();
        let policy = StatusPolicy { ack_timeout: Some(Duration::from_millis(50)), ..policy() };
        let dispatcher = Dispatcher::new(Box::new(MemorySink::new()), policy, Some(region));

        let started = Instant::now();
        dispatcher.on_status_write(&mut cpu(0x1300), &write(0x1004, 0x80));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "handler blocked for {elapsed:?}");
        assert!(matches!(dispatcher.take_event(), Some(StatusEvent::Halt { acknowledged: false, .. })));
    }

    #[test]
    fn acknowledged_halt_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let region = Rc::new(RefCell::new(SharedRegion::create(dir.path(), "d", 4096).unwrap()));
        Board::attach(&region.borrow()).unwrap().acknowledge(1);
        let policy = StatusPolicy { ack_timeout: Some(Duration::from_secs(30)), ..policy() };
        let dispatcher = Dispatcher::new(Box::new(MemorySink::new()), policy, Some(region));

        let started = Instant::now();
        dispatcher.on_status_write(&mut cpu(0x1300), &write(0x1004, 0x80));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(dispatcher.take_event(), Some(StatusEvent::Halt { acknowledged: true, .. })));
    }

    #[test]
    fn observer_stop_request_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let region = Rc::new(RefCell::new(SharedRegion::create(dir.path(), "d", 4096).unwrap()));
        Board::attach(&region.borrow()).unwrap().request_stop();
        let dispatcher = Dispatcher::new(Box::new(MemorySink::new()), policy(), Some(region));

        let mut cpu = cpu(0x1200);
        dispatcher.on_data_write(&mut cpu, &write(0x1000, 1));
        assert!(cpu.stopped);
        assert_eq!(dispatcher.take_event(), Some(StatusEvent::StopRequested { sequence: 1 }));
    }

    #[test]
    fn cpu_errors_are_contained() {
        let mem = MemorySink::new();
        let dispatcher = Dispatcher::new(Box::new(mem.clone()), policy(), None);
        let mut cpu = FakeCpu { pc: None, stopped: false };
        dispatcher.on_data_write(&mut cpu, &write(0x1000, 1));
        assert!(mem.records().is_empty());
    }

    #[test]
    fn panicking_sink_does_not_escape() {
        struct Boom;
        impl ObservationSink for Boom {
            fn record(&mut self, _obs: &Observation) -> Result<()> {
                panic!("sink exploded");
            }
        }
        let dispatcher = Dispatcher::new(Box::new(Boom), policy(), None);
        dispatcher.on_data_write(&mut cpu(0x1200), &write(0x1000, 1));
        assert_eq!(dispatcher.dispatched(), 1);
    }
}
