//! Time-windowed suppression of duplicate frames.
//!
//! Hashes of recently seen frames live in a FIFO of `(arrival, hash)` pairs
//! plus a set of live hashes. Every check evicts expired entries from the
//! FIFO front, so cleanup cost is amortized over the packet stream. Each
//! router owns exactly one cache; the internal mutex keeps it safe should a
//! cache ever be handed across threads.

use ahash::AHasher;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Outcome of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// First sighting within the window; the frame was recorded.
    New,
    /// Identical bytes were seen within the window.
    Duplicate,
}

/// 64-bit hash over the full frame bytes. The CRC participates, so any
/// changed bit re-keys the frame.
#[inline(always)]
fn frame_hash(frame: &[u8]) -> u64 {
    let mut hasher = AHasher::default();
    frame.hash(&mut hasher);
    hasher.finish()
}

struct DedupState {
    period: Duration,
    arrivals: VecDeque<(Instant, u64)>,
    live: HashSet<u64, ahash::RandomState>,
}

/// Duplicate-frame cache with a configurable window.
pub struct Dedup {
    state: Mutex<DedupState>,
}

impl Dedup {
    /// Create a cache with the given window. `Duration::ZERO` disables it.
    pub fn new(period: Duration) -> Self {
        Self {
            state: Mutex::new(DedupState {
                period,
                arrivals: VecDeque::new(),
                live: HashSet::with_hasher(ahash::RandomState::new()),
            }),
        }
    }

    /// Change the window. Zero disables and clears the cache.
    pub fn set_period(&self, period: Duration) {
        let mut state = self.state.lock();
        state.period = period;
        if period.is_zero() {
            state.arrivals.clear();
            state.live.clear();
        }
    }

    /// Check a frame against the window, recording it when new.
    pub fn check(&self, frame: &[u8]) -> PacketStatus {
        let mut state = self.state.lock();
        if state.period.is_zero() {
            return PacketStatus::New;
        }

        // Evict everything that fell out of the window.
        let now = Instant::now();
        let period = state.period;
        while let Some(&(arrival, hash)) = state.arrivals.front() {
            if now.duration_since(arrival) <= period {
                break;
            }
            state.live.remove(&hash);
            state.arrivals.pop_front();
        }

        let hash = frame_hash(frame);
        if state.live.contains(&hash) {
            return PacketStatus::Duplicate;
        }

        state.live.insert(hash);
        state.arrivals.push_back((now, hash));
        PacketStatus::New
    }
}
