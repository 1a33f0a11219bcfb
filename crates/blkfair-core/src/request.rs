//! Request descriptors and their lifecycle states.
//!
//! A request enters the core through `Scheduler::set_request` +
//! `insert_request`, waits in its producer queue, moves to the
//! dispatch list when scheduled, and is handed to the driver by the
//! embedder (`activate_request`). Completion and release
//! (`completed_request`, `put_request`) walk it back out.

use serde::{Deserialize, Serialize};

/// Identifies a live request in the scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub(crate) u32);

impl RequestId {
    /// Raw arena index, for log correlation.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Data direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Index into read/write counter pairs.
    #[must_use]
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// What the embedder tells the core about a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDesc {
    /// Starting sector on the backing device.
    pub sector: u64,
    /// Transfer length in sectors.
    pub sectors: u64,
    /// Data direction.
    pub dir: Direction,
    /// Sync classification: reads and explicitly-synchronous writes.
    pub sync: bool,
    /// Metadata request (journal commits and friends); preferred by
    /// the chooser.
    pub meta: bool,
}

impl RequestDesc {
    /// First sector past the end of the transfer.
    #[must_use]
    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors
    }
}

/// Where a request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Allocated via `set_request`, not yet inserted.
    Allocated,
    /// Waiting in its producer queue.
    Queued,
    /// On the dispatch list, waiting for the embedder to drain it.
    Dispatched,
    /// Issued to the driver.
    InDriver,
    /// Completed; waiting for `put_request`.
    Completed,
}

/// A request tracked by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub desc: RequestDesc,
    pub queue: u32,
    pub pid: u32,
    /// FIFO aging deadline, stamped at insertion.
    pub fifo_deadline_us: u64,
    pub state: RequestState,
}

impl Request {
    pub(crate) fn sector(&self) -> u64 {
        self.desc.sector
    }

    pub(crate) fn sectors(&self) -> u64 {
        self.desc.sectors
    }

    pub(crate) fn end_sector(&self) -> u64 {
        self.desc.end_sector()
    }

    pub(crate) fn is_sync(&self) -> bool {
        self.desc.sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_sector_math() {
        let d = RequestDesc {
            sector: 100,
            sectors: 8,
            dir: Direction::Read,
            sync: true,
            meta: false,
        };
        assert_eq!(d.end_sector(), 108);
    }

    #[test]
    fn direction_indexing() {
        assert_eq!(Direction::Read.index(), 0);
        assert_eq!(Direction::Write.index(), 1);
    }

    #[test]
    fn desc_serde_roundtrip() {
        let d = RequestDesc {
            sector: 42,
            sectors: 16,
            dir: Direction::Write,
            sync: false,
            meta: true,
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: RequestDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
