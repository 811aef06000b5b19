//! Tracking/logging boundary for dispatched register writes.

use std::cell::RefCell;
use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::Path;
use std::rc::Rc;

use log::{debug, warn};
use serde::Serialize;

use crate::board::Board;
use crate::error::{Error, Result};
use crate::region::SharedRegion;
use crate::regmap::Role;

/// One intercepted register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    /// Position in the session-wide stream of writes, starting at 1.
    pub sequence: u64,
    pub role: Role,
    pub address: u64,
    pub pc: u64,
    pub value: u64,
    pub size: usize,
}

pub trait ObservationSink {
    fn record(&mut self, obs: &Observation) -> Result<()>;
}

/// Writes every observation to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl ObservationSink for LogSink {
    fn record(&mut self, obs: &Observation) -> Result<()> {
        match obs.role {
            Role::Data => debug!(
                "Data register write detected at PC: {:#x} with value: {:#x} (#{})",
                obs.pc, obs.value, obs.sequence
            ),
            Role::Status => debug!(
                "Status register write detected at PC: {:#x} with value: {:#x} (#{})",
                obs.pc, obs.value, obs.sequence
            ),
        }
        Ok(())
    }
}

/// One JSON object per line, flushed as each line completes.
pub struct JsonLinesSink {
    out: LineWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        let fh = File::create(path)?;
        debug!("Trace file opened: {:?}", path);
        Ok(Self { out: LineWriter::new(fh) })
    }
}

impl ObservationSink for JsonLinesSink {
    fn record(&mut self, obs: &Observation) -> Result<()> {
        let line = serde_json::to_string(obs).map_err(|e| Error::unexpected("serialising observation", e))?;
        writeln!(self.out, "{}", line)?;
        Ok(())
    }
}

/// Publishes observations on the shared-region board.
pub struct BoardSink {
    region: Rc<RefCell<SharedRegion>>,
}

impl BoardSink {
    pub fn new(region: Rc<RefCell<SharedRegion>>) -> Self {
        Self { region }
    }
}

impl ObservationSink for BoardSink {
    fn record(&mut self, obs: &Observation) -> Result<()> {
        let region = self.region.borrow();
        if !region.is_open() {
            return Err(Error::RegionClosed(region.name().to_string()));
        }
        Board::view(&region)?.publish(obs);
        Ok(())
    }
}

/// Keeps observations in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Rc<RefCell<Vec<Observation>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Observation> {
        self.records.borrow().clone()
    }

    pub fn by_role(&self, role: Role) -> Vec<Observation> {
        self.records.borrow().iter().filter(|o| o.role == role).copied().collect()
    }
}

impl ObservationSink for MemorySink {
    fn record(&mut self, obs: &Observation) -> Result<()> {
        self.records.borrow_mut().push(*obs);
        Ok(())
    }
}

/// Forwards to several sinks. A failing sink does not starve the others;
/// the first failure is returned once all have been tried.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn ObservationSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ObservationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn ObservationSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ObservationSink for FanOut {
    fn record(&mut self, obs: &Observation) -> Result<()> {
        let mut first = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.record(obs) {
                warn!("Observation sink failed for #{}: {}", obs.sequence, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl ObservationSink for Failing {
        fn record(&mut self, _obs: &Observation) -> Result<()> {
            Err(Error::Unexpected("sink down".into()))
        }
    }

    fn obs(sequence: u64) -> Observation {
        Observation { sequence, role: Role::Data, address: 0x1000, pc: 0x1200, value: 0x42, size: 4 }
    }

    #[test]
    fn fan_out_reaches_every_sink_despite_failure() {
        let mem = MemorySink::new();
        let mut fan = FanOut::new().with(Failing).with(mem.clone());
        assert!(fan.record(&obs(1)).is_err());
        assert_eq!(mem.records(), vec![obs(1)]);
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_line() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let mut sink = JsonLinesSink::create(tmp.path()).unwrap();
            sink.record(&obs(1)).unwrap();
            sink.record(&obs(2)).unwrap();
        }
        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["sequence"], 2);
        assert_eq!(v["role"], "data");
        assert_eq!(v["pc"], 0x1200);
        assert_eq!(v["value"], 0x42);
    }

    #[test]
    fn board_sink_refuses_closed_region() {
        let dir = tempfile::tempdir().unwrap();
        let region = Rc::new(RefCell::new(SharedRegion::create(dir.path(), "s", 4096).unwrap()));
        let mut sink = BoardSink::new(region.clone());
        sink.record(&obs(1)).unwrap();
        assert_eq!(Board::view(&region.borrow()).unwrap().snapshot().unwrap().sequence, 1);

        region.borrow_mut().close();
        assert!(matches!(sink.record(&obs(2)), Err(Error::RegionClosed(_))));
    }
}
