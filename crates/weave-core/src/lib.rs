// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replicated causal tree ("weave") core: atom identity, the per-site
//! factory that allocates atoms, and the weave itself — canonical
//! ordering, merge, and content hashing.
//!
//! This crate has no notion of sockets, sessions, or wire framing; see
//! `weave-proto` and `weave-channel` for that layer.

pub mod atom;
pub mod factory;
pub mod weave;

pub use atom::{derive_checksum, Atom, AtomId, Op};
pub use factory::AtomFactory;
pub use weave::{
    sibling_precedes, SiteInfo, StoredCausalTree, Version, Weave, WeaveRef, STORED_FORMAT_VERSION,
};
