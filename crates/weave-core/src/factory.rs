// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Atom factory: per-site Lamport clock and atom allocation.

use crate::atom::{Atom, AtomId, Op};

/// Allocates atoms for a single local site and keeps its Lamport clock
/// correctly advanced in the presence of remote atoms.
///
/// An `AtomFactory` is owned by exactly one logical task, same as the
/// `Weave` it feeds (spec §5): there is no internal locking.
#[derive(Debug, Clone)]
pub struct AtomFactory {
    site_id: u32,
    time: u64,
}

impl AtomFactory {
    /// Create a factory for `site_id`, with its clock at zero.
    #[must_use]
    pub const fn new(site_id: u32) -> Self {
        Self { site_id, time: 0 }
    }

    /// This factory's site id.
    #[must_use]
    pub const fn site_id(&self) -> u32 {
        self.site_id
    }

    /// Current Lamport time (the time of the last created or observed atom).
    #[must_use]
    pub const fn time(&self) -> u64 {
        self.time
    }

    /// Advance the clock having observed `id`.
    ///
    /// Locally-originated atoms (`id.site == site_id`) only need the clock
    /// to catch up; remote atoms additionally tick the clock forward by one
    /// so that the *next* locally-created atom strictly dominates the
    /// observed remote time.
    pub fn update_time(&mut self, id: AtomId) {
        if id.site == self.site_id {
            self.time = self.time.max(id.timestamp);
        } else {
            self.time = self.time.max(id.timestamp) + 1;
        }
    }

    /// Create a new atom for `op`, caused by `cause` (or `None` for a
    /// root), with the default priority (0).
    pub fn create(&mut self, op: Op, cause: Option<AtomId>) -> Atom {
        self.create_with_priority(op, cause, 0)
    }

    /// Create a new atom with an explicit sibling-tiebreak `priority`.
    ///
    /// Priority is part of the atom's identity (spec §9): it is not a
    /// separate kind of operation, only an input to sibling ordering.
    pub fn create_with_priority(&mut self, op: Op, cause: Option<AtomId>, priority: u8) -> Atom {
        self.time += 1;
        let id = AtomId::new(self.site_id, self.time, priority);
        Atom::new(id, cause, op)
    }
}
