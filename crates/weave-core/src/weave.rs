// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The weave: ordered insertion, yarns, version vector, content hash, merge.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atom::{Atom, AtomId};

/// Current on-wire format version for [`StoredCausalTree`].
pub const STORED_FORMAT_VERSION: u32 = 1;

/// A peer's site identifier, as carried in the stored tree and the
/// realtime channel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Non-zero peer identifier.
    pub id: u32,
}

/// Per-site max timestamp plus the content hash of the flat weave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Greatest timestamp observed for each site.
    pub sites: BTreeMap<u32, u64>,
    /// Hex-encoded SHA-256 of the canonical flat-weave serialization.
    pub hash: String,
}

/// Serializable snapshot of a weave, used for wire exchange and persistence
/// (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCausalTree {
    /// Format version of this record.
    pub format_version: u32,
    /// The local site this tree was produced by, if known.
    pub site: Option<SiteInfo>,
    /// Other sites known to have participated, if tracked.
    pub known_sites: Vec<SiteInfo>,
    /// Atoms in flat (canonical) order.
    pub weave: Vec<Atom>,
    /// Version vector + hash at the time this snapshot was taken.
    pub version: Option<Version>,
}

impl StoredCausalTree {
    /// Attach site identity to an otherwise site-agnostic stored tree
    /// (e.g. one just produced by [`Weave::to_stored`]).
    #[must_use]
    pub fn with_site(mut self, site: Option<SiteInfo>, known_sites: Vec<SiteInfo>) -> Self {
        self.site = site;
        self.known_sites = known_sites;
        self
    }
}

/// A stable handle to a stored atom: the atom itself, plus its position
/// within its site's yarn at the time the reference was produced.
///
/// Downstream projections can hold a `WeaveRef` across later merges — it
/// is a value, not a borrow into the weave's internal storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeaveRef {
    /// The stored atom.
    pub atom: Atom,
    /// Position within `atom.id.site`'s yarn when this reference was made.
    pub index_in_yarn: u32,
}

/// Whether sibling atom `a` sorts strictly before sibling atom `b`
/// (spec.md §4.3: higher priority first, then later timestamp first, then
/// lower site first).
#[must_use]
pub fn sibling_precedes(a: AtomId, b: AtomId) -> bool {
    if a.priority != b.priority {
        return a.priority > b.priority;
    }
    if a.timestamp != b.timestamp {
        return a.timestamp > b.timestamp;
    }
    a.site < b.site
}

/// A replicated causal tree: the ordered flat weave, per-site yarns, and
/// the machinery to insert, import, and hash it.
///
/// Atoms are stored once in an append-only arena; the flat order and
/// yarns hold indices into that arena rather than copies (spec.md §9).
#[derive(Debug, Default)]
pub struct Weave {
    atoms: Vec<Atom>,
    flat: Vec<usize>,
    subtree_size: Vec<u32>,
    by_id: HashMap<AtomId, usize>,
    yarns: BTreeMap<u32, Vec<usize>>,
}

impl Weave {
    /// Create an empty weave.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of atoms currently in the weave.
    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Whether the weave has no atoms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// The root atom, if one has been inserted.
    #[must_use]
    pub fn root(&self) -> Option<&Atom> {
        self.flat.first().map(|&idx| &self.atoms[idx])
    }

    /// The flat (canonical, depth-first newest-sibling-first) atom order.
    #[must_use]
    pub fn flat(&self) -> Vec<&Atom> {
        self.flat.iter().map(|&idx| &self.atoms[idx]).collect()
    }

    /// Look up an atom by id.
    #[must_use]
    pub fn get(&self, id: AtomId) -> Option<&Atom> {
        self.by_id.get(&id).map(|&idx| &self.atoms[idx])
    }

    /// `true` if an atom with this id is already present.
    #[must_use]
    pub fn contains(&self, id: AtomId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// The named site's yarn: atoms with `id.site == site`, in
    /// timestamp-increasing order, each paired with its yarn position.
    #[must_use]
    pub fn get_site(&self, site: u32) -> Vec<WeaveRef> {
        self.yarns
            .get(&site)
            .map(|yarn| {
                yarn.iter()
                    .enumerate()
                    .map(|(pos, &idx)| WeaveRef {
                        atom: self.atoms[idx].clone(),
                        index_in_yarn: u32::try_from(pos).unwrap_or(u32::MAX),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All site ids with at least one atom in the weave.
    #[must_use]
    pub fn sites(&self) -> Vec<u32> {
        self.yarns.keys().copied().collect()
    }

    /// Insert a single atom.
    ///
    /// Returns `None` when the atom is rejected: its cause is absent, or
    /// it is a second, different root. Returns the reference to the
    /// existing atom (without mutating anything) when `atom.id` is
    /// already present — `insert` is idempotent.
    pub fn insert(&mut self, atom: Atom) -> Option<WeaveRef> {
        if let Some(&existing_idx) = self.by_id.get(&atom.id) {
            return Some(self.make_ref(existing_idx));
        }

        let insert_pos = match atom.cause {
            None => {
                if !self.flat.is_empty() {
                    return None;
                }
                0
            }
            Some(cause_id) => {
                let &cause_idx = self.by_id.get(&cause_id)?;
                let cause_pos = self.position_in_flat(cause_idx)?;
                self.find_child_insert_pos(cause_pos, atom.id)
            }
        };

        let new_idx = self.atoms.len();
        self.atoms.push(atom);
        self.flat.insert(insert_pos, new_idx);
        self.subtree_size.insert(insert_pos, 1);
        self.by_id.insert(self.atoms[new_idx].id, new_idx);

        if let Some(cause_id) = self.atoms[new_idx].cause {
            self.bump_ancestor_subtree_sizes(cause_id);
        }

        self.insert_into_yarn(new_idx);
        Some(self.make_ref(new_idx))
    }

    /// Import a (possibly incomplete, possibly out-of-order) sequence of
    /// atoms, returning only the references that were newly inserted by
    /// this call.
    ///
    /// Atoms whose causal chain never becomes available — neither earlier
    /// in `atoms` nor already present in the weave — are silently
    /// discarded, as are atoms whose checksum does not match their
    /// contents (spec.md §7, "Checksum mismatch on import").
    pub fn import<I>(&mut self, atoms: I) -> Vec<WeaveRef>
    where
        I: IntoIterator<Item = Atom>,
    {
        let mut pending: Vec<Atom> = atoms
            .into_iter()
            .filter(Atom::checksum_is_valid)
            .collect();
        let mut inserted = Vec::new();

        loop {
            let mut progressed = false;
            let mut next_pending = Vec::with_capacity(pending.len());

            for atom in pending {
                if self.by_id.contains_key(&atom.id) {
                    continue;
                }
                match self.insert(atom.clone()) {
                    Some(reference) => {
                        inserted.push(reference);
                        progressed = true;
                    }
                    None => next_pending.push(atom),
                }
            }

            pending = next_pending;
            if !progressed || pending.is_empty() {
                break;
            }
        }

        inserted
    }

    /// Per-site max timestamps plus the content hash of the flat weave.
    #[must_use]
    pub fn get_version(&self) -> Version {
        let sites = self
            .yarns
            .iter()
            .filter_map(|(&site, yarn)| yarn.last().map(|&idx| (site, self.atoms[idx].id.timestamp)))
            .collect();
        Version {
            sites,
            hash: self.content_hash(),
        }
    }

    /// Produce a serializable snapshot of this weave (site identity left
    /// unset; attach it with [`StoredCausalTree::with_site`]).
    #[must_use]
    pub fn to_stored(&self) -> StoredCausalTree {
        StoredCausalTree {
            format_version: STORED_FORMAT_VERSION,
            site: None,
            known_sites: Vec::new(),
            weave: self.flat.iter().map(|&idx| self.atoms[idx].clone()).collect(),
            version: Some(self.get_version()),
        }
    }

    /// Reconstruct a weave from a stored tree by importing its atoms into
    /// an empty weave. The stored `version` is not trusted — it is
    /// recomputed from the imported atom set.
    #[must_use]
    pub fn from_stored(stored: &StoredCausalTree) -> Self {
        let mut weave = Self::new();
        weave.import(stored.weave.iter().cloned());
        weave
    }

    // ── internal helpers ─────────────────────────────────────────────────

    fn make_ref(&self, idx: usize) -> WeaveRef {
        let atom = self.atoms[idx].clone();
        let index_in_yarn = self.index_in_yarn(atom.id);
        WeaveRef { atom, index_in_yarn }
    }

    fn index_in_yarn(&self, id: AtomId) -> u32 {
        self.yarns
            .get(&id.site)
            .map(|yarn| {
                let pos = yarn.partition_point(|&idx| self.atoms[idx].id.timestamp < id.timestamp);
                u32::try_from(pos).unwrap_or(u32::MAX)
            })
            .unwrap_or_default()
    }

    fn position_in_flat(&self, idx: usize) -> Option<usize> {
        self.flat.iter().position(|&candidate| candidate == idx)
    }

    /// Find where a new child of the atom at `cause_pos` (whose subtree
    /// spans `[cause_pos, cause_pos + subtree_size[cause_pos])`) belongs,
    /// scanning only the cause's *direct* children and jumping whole
    /// sibling subtrees in one step (spec.md §4.2/§9).
    fn find_child_insert_pos(&self, cause_pos: usize, new_id: AtomId) -> usize {
        let cause_idx = self.flat[cause_pos];
        let cause_id = self.atoms[cause_idx].id;
        let end = cause_pos + self.subtree_size[cause_pos] as usize;
        let mut i = cause_pos + 1;

        while i < end {
            let candidate_idx = self.flat[i];
            let candidate = &self.atoms[candidate_idx];
            if candidate.cause == Some(cause_id) {
                if sibling_precedes(new_id, candidate.id) {
                    return i;
                }
                i += self.subtree_size[i] as usize;
            } else {
                // Defensive: only reached if subtree bookkeeping were ever
                // inconsistent. Advancing by one keeps the scan bounded by
                // `end` either way.
                i += 1;
            }
        }
        end
    }

    fn bump_ancestor_subtree_sizes(&mut self, first_ancestor: AtomId) {
        let mut current = Some(first_ancestor);
        while let Some(id) = current {
            let Some(&idx) = self.by_id.get(&id) else {
                break;
            };
            if let Some(pos) = self.position_in_flat(idx) {
                self.subtree_size[pos] += 1;
            }
            current = self.atoms[idx].cause;
        }
    }

    fn insert_into_yarn(&mut self, idx: usize) {
        let atom = &self.atoms[idx];
        let site = atom.id.site;
        let timestamp = atom.id.timestamp;
        let yarn = self.yarns.entry(site).or_default();
        let pos = yarn.partition_point(|&existing| self.atoms[existing].id.timestamp < timestamp);
        yarn.insert(pos, idx);
    }

    fn content_hash(&self) -> String {
        let mut bytes = Vec::new();
        for &idx in &self.flat {
            // Only fails for non-CBOR-representable types or I/O errors;
            // `Atom` has neither, so this can't fail in practice.
            let _ = ciborium::ser::into_writer(&self.atoms[idx], &mut bytes);
        }
        let digest = Sha256::digest(&bytes);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write as _;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::atom::Atom;

    fn atom(site: u32, ts: u64, priority: u8, cause: Option<AtomId>, value: &str) -> Atom {
        Atom::new(AtomId::new(site, ts, priority), cause, value.as_bytes().to_vec())
    }

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    // ── 1. empty weave hashes to the well-known SHA-256 empty-input constant ──

    #[test]
    fn empty_weave_hash_is_well_known_constant() {
        let weave = Weave::new();
        assert_eq!(weave.get_version().hash.len(), 64);
        assert_eq!(weave.get_version().hash, EMPTY_SHA256);
    }

    // ── scenario 1: root idempotence ─────────────────────────────────────

    #[test]
    fn scenario_root_idempotence() {
        let mut w = Weave::new();
        let a = atom(1, 1, 0, None, "1");
        let b = atom(2, 1, 0, None, "2");

        let r1 = w.insert(a.clone()).unwrap();
        let r2 = w.insert(a.clone()).unwrap();
        assert_eq!(r1.atom.id, a.id);
        assert_eq!(r2.atom.id, a.id);
        assert!(w.insert(b).is_none());

        assert_eq!(w.flat().iter().map(|at| at.id).collect::<Vec<_>>(), vec![a.id]);
    }

    // ── scenario 2: sibling ordering, newest-first ───────────────────────

    #[test]
    fn scenario_newest_sibling_first() {
        let mut w = Weave::new();
        let a = atom(1, 1, 0, None, "root");
        w.insert(a.clone()).unwrap();
        let b = atom(1, 2, 0, Some(a.id), "b");
        let c = atom(2, 3, 0, Some(a.id), "c");
        w.insert(b.clone()).unwrap();
        w.insert(c.clone()).unwrap();

        let ids: Vec<_> = w.flat().iter().map(|at| at.id).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);
    }

    // ── scenario 3: priority beats timestamp ─────────────────────────────

    #[test]
    fn scenario_priority_beats_timestamp() {
        let mut w = Weave::new();
        let a = atom(1, 1, 0, None, "root");
        w.insert(a.clone()).unwrap();
        let b = atom(1, 3, 0, Some(a.id), "b");
        let c = atom(2, 4, 0, Some(a.id), "c");
        let d = atom(3, 2, 1, Some(a.id), "d");
        w.insert(b.clone()).unwrap();
        w.insert(c.clone()).unwrap();
        w.insert(d.clone()).unwrap();

        let ids: Vec<_> = w.flat().iter().map(|at| at.id).collect();
        assert_eq!(ids, vec![a.id, d.id, c.id, b.id]);
    }

    // ── scenario 4: site id tiebreak ──────────────────────────────────────

    #[test]
    fn scenario_site_id_tiebreak() {
        let mut w = Weave::new();
        let a = atom(1, 1, 0, None, "root");
        w.insert(a.clone()).unwrap();
        let b = atom(1, 2, 0, Some(a.id), "b");
        let c = atom(2, 2, 0, Some(a.id), "c");
        w.insert(b.clone()).unwrap();
        w.insert(c.clone()).unwrap();

        let ids: Vec<_> = w.flat().iter().map(|at| at.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    // ── scenario 5: merge convergence regardless of import order ─────────

    #[test]
    fn scenario_merge_convergence() {
        let root = atom(1, 1, 0, None, "root");
        let a1 = atom(1, 2, 0, Some(root.id), "a1");
        let a2 = atom(1, 3, 0, Some(a1.id), "a2");
        let a3 = atom(1, 4, 0, Some(a2.id), "a3");
        let a4 = atom(2, 5, 0, Some(a3.id), "a4");
        let a5 = atom(2, 6, 0, Some(a4.id), "a5");
        let a6 = atom(3, 5, 0, Some(a3.id), "a6");

        let mut x = Weave::new();
        for a in [root.clone(), a1.clone(), a2.clone(), a3.clone(), a6.clone()] {
            x.insert(a).unwrap();
        }
        let mut y = Weave::new();
        for a in [root.clone(), a1.clone(), a2.clone(), a3.clone(), a4.clone(), a5.clone()] {
            y.insert(a).unwrap();
        }

        let mut z = Weave::new();
        z.import(x.flat().into_iter().cloned().collect::<Vec<_>>());
        z.import(y.flat().into_iter().cloned().collect::<Vec<_>>());

        let mut z_prime = Weave::new();
        z_prime.import(y.flat().into_iter().cloned().collect::<Vec<_>>());
        z_prime.import(x.flat().into_iter().cloned().collect::<Vec<_>>());

        let z_ids: Vec<_> = z.flat().iter().map(|a| a.id).collect();
        let zp_ids: Vec<_> = z_prime.flat().iter().map(|a| a.id).collect();
        assert_eq!(z_ids, zp_ids);
        assert_eq!(z.get_version().hash, z_prime.get_version().hash);
    }

    // ── scenario 6: version vector across insertion permutations ─────────

    #[test]
    fn scenario_version_vector_stable_across_permutations() {
        let root = atom(1, 1, 0, None, "root");
        let a = atom(9, 2, 0, Some(root.id), "a");
        let b = atom(2, 3, 0, Some(a.id), "b");
        let c = atom(1, 4, 0, Some(b.id), "c");

        let mut forward = Weave::new();
        for at in [root.clone(), a.clone(), b.clone(), c.clone()] {
            forward.insert(at).unwrap();
        }
        let version = forward.get_version();
        assert_eq!(version.sites.get(&1), Some(&4));
        assert_eq!(version.sites.get(&2), Some(&3));
        assert_eq!(version.sites.get(&9), Some(&2));

        let mut shuffled = Weave::new();
        shuffled.import(vec![c, root, b, a]);
        assert_eq!(shuffled.get_version().hash, version.hash);
    }

    // ── rejection: cause not yet present ──────────────────────────────────

    #[test]
    fn insert_rejects_missing_cause() {
        let mut w = Weave::new();
        let orphan = atom(1, 5, 0, Some(AtomId::new(9, 9, 0)), "orphan");
        assert!(w.insert(orphan).is_none());
        assert!(w.is_empty());
    }

    // ── rejection: second distinct root ───────────────────────────────────

    #[test]
    fn insert_rejects_second_root() {
        let mut w = Weave::new();
        w.insert(atom(1, 1, 0, None, "root-a")).unwrap();
        assert!(w.insert(atom(2, 1, 0, None, "root-b")).is_none());
    }

    // ── import discards atoms whose cause never arrives ───────────────────

    #[test]
    fn import_discards_unreachable_atoms() {
        let mut w = Weave::new();
        let root = atom(1, 1, 0, None, "root");
        let orphan = atom(2, 9, 0, Some(AtomId::new(5, 5, 0)), "orphan");
        let reachable = atom(2, 2, 0, Some(root.id), "reachable");

        let inserted = w.import(vec![orphan, root.clone(), reachable.clone()]);
        let ids: Vec<_> = inserted.iter().map(|r| r.atom.id).collect();
        assert!(ids.contains(&root.id));
        assert!(ids.contains(&reachable.id));
        assert_eq!(ids.len(), 2);
        assert_eq!(w.len(), 2);
    }

    // ── import ignores checksum-tampered atoms ─────────────────────────────

    #[test]
    fn import_discards_checksum_mismatch() {
        let mut w = Weave::new();
        let mut root = atom(1, 1, 0, None, "root");
        root.value = b"tampered".to_vec();
        assert!(!root.checksum_is_valid());

        let inserted = w.import(vec![root]);
        assert!(inserted.is_empty());
        assert!(w.is_empty());
    }

    // ── round trip: stored tree reproduces an identical flat weave/hash ───

    #[test]
    fn round_trip_stored_tree() {
        let mut w = Weave::new();
        let root = atom(1, 1, 0, None, "root");
        let child = atom(1, 2, 0, Some(root.id), "child");
        w.insert(root).unwrap();
        w.insert(child).unwrap();

        let stored = w.to_stored();
        let restored = Weave::from_stored(&stored);

        let original_ids: Vec<_> = w.flat().iter().map(|a| a.id).collect();
        let restored_ids: Vec<_> = restored.flat().iter().map(|a| a.id).collect();
        assert_eq!(original_ids, restored_ids);
        assert_eq!(w.get_version().hash, restored.get_version().hash);
    }

    // ── yarn invariant: timestamp-increasing, contains every atom of that site ──

    #[test]
    fn yarn_is_timestamp_increasing_and_complete() {
        let mut w = Weave::new();
        let root = atom(1, 1, 0, None, "root");
        let a = atom(1, 2, 0, Some(root.id), "a");
        let b = atom(1, 3, 0, Some(a.id), "b");
        w.insert(root.clone()).unwrap();
        w.insert(a.clone()).unwrap();
        w.insert(b.clone()).unwrap();

        let yarn = w.get_site(1);
        let timestamps: Vec<_> = yarn.iter().map(|r| r.atom.id.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert_eq!(yarn.len(), 3);
        for (expected_pos, reference) in yarn.iter().enumerate() {
            assert_eq!(reference.index_in_yarn as usize, expected_pos);
        }
    }

    // ── get_site returns references in yarn order, omits other sites ──────

    #[test]
    fn get_site_is_scoped_to_one_site() {
        let mut w = Weave::new();
        let root = atom(1, 1, 0, None, "root");
        let other = atom(2, 2, 0, Some(root.id), "other");
        w.insert(root).unwrap();
        w.insert(other).unwrap();

        assert_eq!(w.get_site(1).len(), 1);
        assert_eq!(w.get_site(2).len(), 1);
        assert!(w.get_site(99).is_empty());
    }
}
