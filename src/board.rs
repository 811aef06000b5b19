//! Observation board published at the start of the shared region.
//!
//! The board is an array of little-endian 32-bit words so it can be read
//! from any language as a plain `u32[]`. The session is the only writer of
//! the record words; the observer owns `STOP_REQUEST` and `ACK`.
//!
//! Record updates follow a sequence-lock protocol:
//! 1) bump `GENERATION` to an odd value,
//! 2) store the record words,
//! 3) bump `GENERATION` to the next even value.
//!
//! A reader that sees the same even generation before and after copying the
//! record has an untorn snapshot. The writer never waits on readers.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::region::SharedRegion;
use crate::regmap::Role;
use crate::sink::Observation;

/// `b"RTAP"` as a little-endian `u32`.
pub const BOARD_MAGIC: u32 = 0x5041_5452;
pub const BOARD_VERSION: u32 = 1;

pub const BOARD_WORDS: usize = 16;
pub const BOARD_BYTES: usize = BOARD_WORDS * 4;

/// Retries a reader makes before giving up on a busy writer.
const SNAPSHOT_RETRIES: usize = 1024;

pub mod word {
    //! Indices into the board when viewed as a `u32[]`.

    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 1;
    pub const GENERATION: usize = 2;
    pub const ROLE: usize = 3;
    pub const ADDRESS_LO: usize = 4;
    pub const ADDRESS_HI: usize = 5;
    pub const PC_LO: usize = 6;
    pub const PC_HI: usize = 7;
    pub const VALUE_LO: usize = 8;
    pub const VALUE_HI: usize = 9;
    pub const SEQUENCE_LO: usize = 10;
    pub const SEQUENCE_HI: usize = 11;
    pub const STATUS: usize = 12;
    pub const STOP_REQUEST: usize = 13;
    pub const ACK: usize = 14;
    pub const STATE: usize = 15;
}

/// Last record published on the board, as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardRecord {
    pub generation: u32,
    pub role: Option<Role>,
    pub address: u64,
    pub pc: u64,
    pub value: u64,
    pub sequence: u64,
}

#[derive(Clone, Copy)]
pub struct Board<'a> {
    words: &'a [AtomicU32],
}

impl<'a> Board<'a> {
    /// Attach to the board in `region`, initialising a zeroed header.
    pub fn attach(region: &'a SharedRegion) -> Result<Self> {
        let board = Self::view(region)?;
        match board.load(word::MAGIC) {
            0 => {
                board.store(word::VERSION, BOARD_VERSION);
                board.store(word::MAGIC, BOARD_MAGIC);
            }
            BOARD_MAGIC => {
                let version = board.load(word::VERSION);
                if version != BOARD_VERSION {
                    return Err(Error::unexpected(
                        &format!("shared region {}", region.name()),
                        format!("board version {version}, expected {BOARD_VERSION}"),
                    ));
                }
            }
            other => {
                return Err(Error::unexpected(
                    &format!("shared region {}", region.name()),
                    format!("foreign layout (magic {other:#x})"),
                ));
            }
        }
        Ok(board)
    }

    /// Board view without header checks.
    pub fn view(region: &'a SharedRegion) -> Result<Self> {
        let words = region.words()?;
        if words.len() < BOARD_WORDS {
            return Err(Error::RegionTooSmall {
                name: region.name().to_string(),
                size: region.size(),
                needed: BOARD_BYTES as u64,
            });
        }
        Ok(Self { words: &words[..BOARD_WORDS] })
    }

    pub fn from_words(words: &'a [AtomicU32]) -> Option<Self> {
        (words.len() >= BOARD_WORDS).then(|| Self { words: &words[..BOARD_WORDS] })
    }

    fn load(&self, idx: usize) -> u32 {
        self.words[idx].load(Ordering::SeqCst)
    }

    fn store(&self, idx: usize, val: u32) {
        self.words[idx].store(val, Ordering::SeqCst);
    }

    fn store_u64(&self, lo: usize, hi: usize, val: u64) {
        self.store(lo, val as u32);
        self.store(hi, (val >> 32) as u32);
    }

    fn load_u64(&self, lo: usize, hi: usize) -> u64 {
        (self.load(hi) as u64) << 32 | self.load(lo) as u64
    }

    /// Publish one observation. Returns the new (even) generation.
    pub fn publish(&self, obs: &Observation) -> u32 {
        let start = self.load(word::GENERATION) & !1;
        self.store(word::GENERATION, start.wrapping_add(1));

        self.store(word::ROLE, obs.role.code());
        self.store_u64(word::ADDRESS_LO, word::ADDRESS_HI, obs.address);
        self.store_u64(word::PC_LO, word::PC_HI, obs.pc);
        self.store_u64(word::VALUE_LO, word::VALUE_HI, obs.value);
        self.store_u64(word::SEQUENCE_LO, word::SEQUENCE_HI, obs.sequence);
        if obs.role == Role::Status {
            self.store(word::STATUS, obs.value as u32);
        }

        let generation = start.wrapping_add(2);
        self.store(word::GENERATION, generation);
        generation
    }

    /// Copy the last record, or `None` if the writer stayed busy.
    pub fn snapshot(&self) -> Option<BoardRecord> {
        for _ in 0..SNAPSHOT_RETRIES {
            let gen0 = self.load(word::GENERATION);
            if gen0 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            let record = BoardRecord {
                generation: gen0,
                role: Role::from_code(self.load(word::ROLE)),
                address: self.load_u64(word::ADDRESS_LO, word::ADDRESS_HI),
                pc: self.load_u64(word::PC_LO, word::PC_HI),
                value: self.load_u64(word::VALUE_LO, word::VALUE_HI),
                sequence: self.load_u64(word::SEQUENCE_LO, word::SEQUENCE_HI),
            };

            if self.load(word::GENERATION) == gen0 {
                return Some(record);
            }
        }
        None
    }

    pub fn last_status(&self) -> u32 {
        self.load(word::STATUS)
    }

    pub fn stop_requested(&self) -> bool {
        self.load(word::STOP_REQUEST) != 0
    }

    /// Observer side: ask the session to stop at its next dispatch.
    pub fn request_stop(&self) {
        self.store(word::STOP_REQUEST, 1);
    }

    pub fn clear_stop(&self) {
        self.store(word::STOP_REQUEST, 0);
    }

    /// Forget observer input and the last status left by an earlier session.
    ///
    /// Sequences restart at 1 for every session, so a stale `ACK` would
    /// acknowledge a new halt and a stale `STOP_REQUEST` would end the new
    /// run at its first write.
    pub fn reset_controls(&self) {
        self.store(word::STOP_REQUEST, 0);
        self.store(word::ACK, 0);
        self.store(word::STATUS, 0);
    }

    pub fn ack(&self) -> u32 {
        self.load(word::ACK)
    }

    /// Observer side: acknowledge the status observation with `sequence`.
    pub fn acknowledge(&self, sequence: u64) {
        self.store(word::ACK, sequence as u32);
    }

    pub fn is_acknowledged(&self, sequence: u64) -> bool {
        self.ack() == sequence as u32
    }

    pub fn set_state(&self, code: u32) {
        self.store(word::STATE, code);
    }

    pub fn state(&self) -> u32 {
        self.load(word::STATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(sequence: u64, role: Role, value: u64) -> Observation {
        Observation { sequence, role, address: 0x1000, pc: 0x1200, value, size: 4 }
    }

    #[test]
    fn attach_initialises_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), "b", 4096).unwrap();
        let board = Board::attach(&region).unwrap();
        assert_eq!(region.words().unwrap()[word::MAGIC].load(Ordering::SeqCst), BOARD_MAGIC);
        board.set_state(3);

        let again = Board::attach(&region).unwrap();
        assert_eq!(again.state(), 3);
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), "b", 4096).unwrap();
        region.words().unwrap()[word::MAGIC].store(0x1234, Ordering::SeqCst);
        assert!(matches!(Board::attach(&region), Err(Error::Unexpected(_))));
    }

    #[test]
    fn small_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), "b", 16).unwrap();
        assert!(matches!(
            Board::attach(&region),
            Err(Error::RegionTooSmall { needed: 64, .. })
        ));
    }

    #[test]
    fn publish_then_snapshot_reads_back_record() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), "b", 4096).unwrap();
        let board = Board::attach(&region).unwrap();

        let generation = board.publish(&obs(1, Role::Data, 0x1_0000_0042));
        assert_eq!(generation, 2);
        let snap = board.snapshot().unwrap();
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.role, Some(Role::Data));
        assert_eq!(snap.value, 0x1_0000_0042);
        assert_eq!(snap.pc, 0x1200);
        assert_eq!(board.last_status(), 0);

        board.publish(&obs(2, Role::Status, 0x80));
        assert_eq!(board.last_status(), 0x80);
        assert_eq!(board.snapshot().unwrap().sequence, 2);
    }

    #[test]
    fn snapshot_gives_up_on_stuck_writer() {
        let words: Vec<AtomicU32> = (0..BOARD_WORDS).map(|_| AtomicU32::new(0)).collect();
        let board = Board::from_words(&words).unwrap();
        words[word::GENERATION].store(5, Ordering::SeqCst);
        assert_eq!(board.snapshot(), None);
    }

    #[test]
    fn control_words_round_trip() {
        let words: Vec<AtomicU32> = (0..BOARD_WORDS).map(|_| AtomicU32::new(0)).collect();
        let board = Board::from_words(&words).unwrap();
        assert!(!board.stop_requested());
        board.request_stop();
        assert!(board.stop_requested());
        board.clear_stop();
        assert!(!board.stop_requested());

        assert!(!board.is_acknowledged(7));
        board.acknowledge(7);
        assert!(board.is_acknowledged(7));
    }

    #[test]
    fn reset_controls_keeps_record_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::create(dir.path(), "b", 4096).unwrap();
        let board = Board::attach(&region).unwrap();
        board.publish(&obs(1, Role::Status, 0x80));
        board.request_stop();
        board.acknowledge(1);

        board.reset_controls();
        assert!(!board.stop_requested());
        assert!(!board.is_acknowledged(1));
        assert_eq!(board.last_status(), 0);
        assert_eq!(board.snapshot().unwrap().sequence, 1);
        assert!(Board::attach(&region).is_ok());
    }
}
