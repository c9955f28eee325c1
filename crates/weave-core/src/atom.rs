// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Atom identity and the immutable atom itself.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque, application-defined operation payload.
///
/// The core never interprets `Op` — it is serialized bytes supplied by
/// the caller. Applications should encode a tagged enum into these bytes
/// (and decode it back out downstream); the weave only needs to hash,
/// store, and replay them in order.
pub type Op = Vec<u8>;

/// Identity of an atom: the site that created it, the Lamport time it was
/// created at, and a tiebreak priority.
///
/// Two ids are equal iff all three fields match. Ordering among sibling
/// atoms is defined in [`crate::weave::sibling_precedes`], not here —
/// `AtomId` itself only derives the structural `PartialOrd`/`Ord` used for
/// map keys and deterministic iteration, which is plain field-order
/// comparison and is *not* the weave's sibling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AtomId {
    /// Non-zero peer identifier that created this atom.
    pub site: u32,
    /// Lamport time at which the atom was created.
    pub timestamp: u64,
    /// Tiebreak priority among siblings (defaults to 0).
    pub priority: u8,
}

impl AtomId {
    /// Construct an id from its three fields.
    #[must_use]
    pub const fn new(site: u32, timestamp: u64, priority: u8) -> Self {
        Self {
            site,
            timestamp,
            priority,
        }
    }
}

impl std::fmt::Display for AtomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.site, self.timestamp, self.priority)
    }
}

/// An immutable unit of edit history.
///
/// `cause` is `None` iff this is the weave's root atom. `checksum` is a
/// display-only integrity value derived from `id`, `cause`, and `value` —
/// see [`derive_checksum`]. It is not a security mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    /// This atom's identity.
    pub id: AtomId,
    /// The parent atom's id, or `None` iff this is the root.
    pub cause: Option<AtomId>,
    /// Opaque application payload.
    pub value: Op,
    /// Deterministic 32-bit integrity value over `id` + `cause` + `value`.
    pub checksum: u32,
}

impl Atom {
    /// Build an atom, computing its checksum from the given fields.
    #[must_use]
    pub fn new(id: AtomId, cause: Option<AtomId>, value: Op) -> Self {
        let checksum = derive_checksum(id, cause, &value);
        Self {
            id,
            cause,
            value,
            checksum,
        }
    }

    /// Whether this atom's stored checksum matches a freshly-derived one.
    ///
    /// Used by `Weave::import` to discard corrupted entries (spec §7,
    /// "Checksum mismatch on import").
    #[must_use]
    pub fn checksum_is_valid(&self) -> bool {
        derive_checksum(self.id, self.cause, &self.value) == self.checksum
    }
}

/// Canonical bytes hashed to derive an atom's checksum and the weave's
/// content hash: `id` and `cause` are CBOR-encoded, `value` bytes are
/// appended verbatim (they are already an opaque byte string, so no
/// further encoding is needed).
fn canonical_bytes(id: AtomId, cause: Option<AtomId>, value: &[u8]) -> Vec<u8> {
    #[derive(Serialize)]
    struct Header {
        id: AtomId,
        cause: Option<AtomId>,
    }
    let mut out = Vec::new();
    // `ciborium::ser::into_writer` only fails on I/O errors or types that
    // can't be represented in CBOR; `Header` is neither, so this can't fail.
    if ciborium::ser::into_writer(&Header { id, cause }, &mut out).is_err() {
        out.clear();
    }
    out.extend_from_slice(value);
    out
}

/// Derive a 32-bit checksum from an atom's identity, cause, and value.
///
/// Per spec.md §9 this is "any 32-bit value derived deterministically
/// from id + cause + canonical value bytes", not a security mechanism:
/// the top 4 bytes of `SHA-256(canonical_bytes(...))`.
#[must_use]
pub fn derive_checksum(id: AtomId, cause: Option<AtomId>, value: &[u8]) -> u32 {
    let bytes = canonical_bytes(id, cause, value);
    let digest = Sha256::digest(&bytes);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── 1. checksum is deterministic ─────────────────────────────────────

    #[test]
    fn checksum_is_deterministic() {
        let id = AtomId::new(1, 2, 0);
        let cause = Some(AtomId::new(1, 1, 0));
        let a = derive_checksum(id, cause, b"hello");
        let b = derive_checksum(id, cause, b"hello");
        assert_eq!(a, b);
    }

    // ── 2. checksum differs when any field differs ──────────────────────

    #[test]
    fn checksum_changes_with_inputs() {
        let id = AtomId::new(1, 2, 0);
        let cause = Some(AtomId::new(1, 1, 0));
        let base = derive_checksum(id, cause, b"hello");
        assert_ne!(base, derive_checksum(id, None, b"hello"));
        assert_ne!(base, derive_checksum(id, cause, b"world"));
        assert_ne!(
            base,
            derive_checksum(AtomId::new(2, 2, 0), cause, b"hello")
        );
    }

    // ── 3. Atom::new validates via checksum_is_valid ────────────────────

    #[test]
    fn new_atom_has_valid_checksum() {
        let atom = Atom::new(AtomId::new(1, 1, 0), None, b"root".to_vec());
        assert!(atom.checksum_is_valid());
    }

    // ── 4. tampering breaks checksum_is_valid ───────────────────────────

    #[test]
    fn tampered_value_breaks_checksum() {
        let mut atom = Atom::new(AtomId::new(1, 1, 0), None, b"root".to_vec());
        atom.value = b"tampered".to_vec();
        assert!(!atom.checksum_is_valid());
    }
}
