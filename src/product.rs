use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::warn;

use crate::wire::WmoHeading;

/*
Product lifecycle, driven solely by the sender engine:

                    +-------+
                    | Free  |<------------------------------+
                    +-------+                               |
                        | queued from a directory scan      |
                        V                                   |
                    +--------+   queue TTL expired   +------+
                    | Queued |---------------------->| Dead |
                    +--------+                       +------+
                        | transmitted                    ^
                        V                                |
          +--------- +------+ ----------+                |
          |          | Sent |           |                |
          |          +------+           |                |
     ack 'K'         ack 'F'       ack 'R' / partial     |
          |             |               |                |
          V             V               V                |
      +-------+     +--------+      +-------+  TTL       |
      | Acked |     | Nacked |      | Retry |------------+
      +-------+     +--------+      +-------+
          |             |               | retransmitted
          |             |               V
          |             |           (Sent again)
          +------+------+
                 |
                 V
          slot released (Free)

A send that can never succeed (size changed underfoot, retries exhausted)
marks the product Failed and releases the slot after the abort move.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProductState {
    #[default]
    Free,
    Queued,
    Sent,
    Acked,
    Nacked,
    Retry,
    Failed,
    Dead,
}

/// One file in transit.
#[derive(Debug, Clone, Default)]
pub struct Product {
    pub seqno: u32,
    pub filename: PathBuf,
    pub wmo: Option<WmoHeading>,
    /// Payload bytes to transmit, excluding any stripped CCB preamble.
    pub size: u64,
    pub ccb_len: usize,
    pub state: ProductState,
    pub send_count: u32,
    /// Epoch seconds; for scanned files this is the file mtime.
    pub queue_time: u64,
    pub send_time: Option<Instant>,
    pub priority: u32,
    pub announcement: bool,
}

impl Product {
    fn reset(&mut self) {
        *self = Product::default();
    }
}

/// Fixed-capacity table backing the sliding window. Every slot is on exactly
/// one of three FIFO lists:
///
///   free — available for new work
///   ack  — transmitted, awaiting acknowledgement, oldest send first
///   retr — awaiting (re)transmission; the head is the current product
pub struct ProductTable {
    slots: Vec<Product>,
    free: VecDeque<usize>,
    ack: VecDeque<usize>,
    retr: VecDeque<usize>,
}

impl ProductTable {
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "window size must be positive");
        ProductTable {
            slots: (0..window_size).map(|_| Product::default()).collect(),
            free: (0..window_size).collect(),
            ack: VecDeque::new(),
            retr: VecDeque::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> &Product {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Product {
        &mut self.slots[idx]
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn ack_len(&self) -> usize {
        self.ack.len()
    }

    pub fn retr_len(&self) -> usize {
        self.retr.len()
    }

    /// Pop a slot off the free list. The caller populates it and pushes it
    /// onto the retr list before the next table operation.
    pub fn take_free(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    pub fn push_retr(&mut self, idx: usize) {
        self.retr.push_back(idx);
    }

    pub fn push_retr_front(&mut self, idx: usize) {
        self.retr.push_front(idx);
    }

    pub fn retr_head(&self) -> Option<usize> {
        self.retr.front().copied()
    }

    pub fn pop_retr(&mut self) -> Option<usize> {
        self.retr.pop_front()
    }

    /// Take the youngest entry off the retr list, making room for a slot
    /// that must jump the queue.
    pub fn steal_retr_tail(&mut self) -> Option<usize> {
        self.retr.pop_back()
    }

    pub fn push_ack(&mut self, idx: usize) {
        self.ack.push_back(idx);
    }

    pub fn ack_head(&self) -> Option<usize> {
        self.ack.front().copied()
    }

    pub fn pop_ack(&mut self) -> Option<usize> {
        self.ack.pop_front()
    }

    /// Remove `idx` from whichever list currently holds it, if any.
    pub fn unlink(&mut self, idx: usize) {
        self.free.retain(|&i| i != idx);
        self.ack.retain(|&i| i != idx);
        self.retr.retain(|&i| i != idx);
    }

    /// Clear the slot and return it to the free list.
    pub fn release(&mut self, idx: usize) {
        self.slots[idx].reset();
        self.free.push_back(idx);
    }

    /// Move everything awaiting acknowledgement back onto the retr list,
    /// preserving age order ahead of anything already there. Called on
    /// reconnect: acks for products sent on the old connection are presumed
    /// lost. An announcement slot is skipped; a fresh announcement is
    /// synthesized for the new connection instead.
    pub fn drain_ack_to_retr(&mut self, announce_slot: Option<usize>) {
        let mut at = match (self.retr.front(), announce_slot) {
            (Some(&head), Some(a)) if head == a => 1,
            _ => 0,
        };

        while let Some(idx) = self.ack.pop_front() {
            self.slots[idx].state = ProductState::Retry;
            if Some(idx) == announce_slot {
                // The engine rebuilds the announcement before replaying;
                // keep its slot at the very front either way.
                self.retr.push_front(idx);
            } else {
                self.retr.insert(at, idx);
            }
            at += 1;
        }
    }

    /// True when `path` is already in the in-flight window (ack or retr).
    pub fn in_flight(&self, path: &Path) -> bool {
        self.ack
            .iter()
            .chain(self.retr.iter())
            .any(|&i| self.slots[i].filename == path)
    }

    /// Every slot on exactly one list and the three lists cover the table.
    pub fn consistent(&self) -> bool {
        if self.free.len() + self.ack.len() + self.retr.len() != self.slots.len() {
            return false;
        }
        let mut seen = vec![false; self.slots.len()];
        for &i in self.free.iter().chain(self.ack.iter()).chain(self.retr.iter()) {
            if i >= seen.len() || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        true
    }

    /// Reconstruct the lists from per-slot state after a detected
    /// inconsistency. List operations are total, so this is a recovery path
    /// that should stay unreachable.
    pub fn rebuild(&mut self) {
        warn!("product table inconsistent, rebuilding lists from slot states");

        self.free.clear();
        self.ack.clear();
        self.retr.clear();

        let mut sent: Vec<usize> = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot.state {
                ProductState::Queued | ProductState::Retry => self.retr.push_back(i),
                ProductState::Sent => sent.push(i),
                _ => {
                    slot.reset();
                    self.free.push_back(i);
                }
            }
        }

        // The ack list is ordered by send time, oldest first.
        sent.sort_by_key(|&i| self.slots[i].send_time);
        self.ack.extend(sent);
    }
}
