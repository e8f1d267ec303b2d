//! Append-only per-peer log of committed changesets.
//!
//! Each entry records the encoded changeset (transformed form for
//! remote-origin entries), its origin metadata, and the reciprocal
//! transforms already produced for other peers. The log also answers the
//! direction-aware scan both sides of the protocol use to find the next
//! entry to send or to merge against.

use crate::changeset::Changeset;
use crate::error::Result;
use crate::id::{FileIdent, SaltedVersion, Timestamp, Version};
use crate::instruction::Instruction;
use crate::value::Payload;
use fnv::FnvHashMap;

/// One committed changeset with its sync metadata.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    /// Local version this entry produced.
    pub version: Version,
    /// Producing peer, or 0 for a locally produced entry.
    pub origin_file: FileIdent,
    /// Producing peer's timestamp.
    pub origin_timestamp: Timestamp,
    /// Producing peer's own version, for remote-origin entries.
    pub remote_version: Version,
    /// Encoded changeset. For remote-origin entries this is the
    /// transformed form that was applied locally, so retransmissions stay
    /// consistent.
    pub changeset: Vec<u8>,
    reciprocals: FnvHashMap<FileIdent, Vec<u8>>,
}

/// The per-file history log.
///
/// Versions are contiguous: the baseline (empty) state is version 1 and
/// each appended entry produces the next version.
#[derive(Clone, Debug)]
pub struct SyncHistory {
    local_file: FileIdent,
    salt: u64,
    entries: Vec<HistoryEntry>,
}

impl SyncHistory {
    /// Creates an empty history for the given file.
    pub fn new(local_file: FileIdent) -> Self {
        Self {
            local_file,
            salt: 0,
            entries: Vec::new(),
        }
    }

    /// The owning file's identity.
    pub fn local_file(&self) -> FileIdent {
        self.local_file
    }

    /// Records the coordinator-issued salt propagated with snapshots.
    pub fn set_salt(&mut self, salt: u64) {
        self.salt = salt;
    }

    /// The current version: baseline 1 plus one per entry.
    pub fn current_version(&self) -> Version {
        1 + self.entries.len() as Version
    }

    /// The current version paired with the propagated salt.
    pub fn snapshot(&self) -> SaltedVersion {
        SaltedVersion::new(self.current_version(), self.salt)
    }

    /// Appends an entry, assigning it the next version.
    pub fn append(
        &mut self,
        changeset: Vec<u8>,
        origin_file: FileIdent,
        origin_timestamp: Timestamp,
        remote_version: Version,
    ) -> Version {
        let version = self.current_version() + 1;
        self.entries.push(HistoryEntry {
            version,
            origin_file,
            origin_timestamp,
            remote_version,
            changeset,
            reciprocals: FnvHashMap::default(),
        });
        version
    }

    /// Random-access read of the entry that produced `version`.
    pub fn entry_at(&self, version: Version) -> Option<&HistoryEntry> {
        if version < 2 {
            return None;
        }
        self.entries.get(version as usize - 2)
    }

    /// True if the entry with the given origin is producible for
    /// `remote`: the coordinator serves every entry that did not come from
    /// the remote itself, a regular peer serves only its locally produced
    /// entries. The same scan drives uploads and the transformer's
    /// concurrent window.
    fn producible(&self, origin: FileIdent, remote: FileIdent) -> bool {
        if self.local_file.is_coordinator() {
            origin != remote
        } else {
            origin.is_local()
        }
    }

    /// Scans `(begin, end]` and returns the first version producible for
    /// `remote_file`, or 0 when there is none. With `only_nonempty`,
    /// entries whose changeset is empty are skipped.
    pub fn find_next(
        &self,
        begin: Version,
        end: Version,
        remote_file: FileIdent,
        only_nonempty: bool,
    ) -> Version {
        let mut version = begin.max(1) + 1;
        while version <= end {
            if let Some(entry) = self.entry_at(version) {
                if self.producible(entry.origin_file, remote_file)
                    && !(only_nonempty && entry.changeset.is_empty())
                {
                    return version;
                }
            }
            version += 1;
        }
        0
    }

    /// The bytes to send to `remote_file` for the changeset produced at
    /// `version`: the stored reciprocal transform if one exists, otherwise
    /// the original bytes. A zero-length result is a fully discarded
    /// changeset, not an error.
    pub fn reciprocal(&self, remote_file: FileIdent, version: Version) -> &[u8] {
        let entry = self
            .entry_at(version)
            .expect("reciprocal of unknown version");
        entry
            .reciprocals
            .get(&remote_file)
            .map(|b| b.as_slice())
            .unwrap_or(&entry.changeset)
    }

    /// Records or overwrites the reciprocal transform for `remote_file` at
    /// `version`. Idempotent on content; an empty changeset is recorded as
    /// zero bytes.
    pub fn set_reciprocal(&mut self, remote_file: FileIdent, version: Version, bytes: Vec<u8>) {
        let entry = &mut self.entries[version as usize - 2];
        entry.reciprocals.insert(remote_file, bytes);
    }

    /// Drops every entry after `version`. Used to undo a failed batch;
    /// reciprocal updates on surviving entries are kept, since they are
    /// idempotent on content.
    pub(crate) fn rollback_to(&mut self, version: Version) {
        let keep = version.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// True if the entry arrived over the link to `remote`. The mirror
    /// of [`SyncHistory::producible`]: a regular peer receives every
    /// remote-origin entry through the coordinator, whatever the origin
    /// tag says.
    fn received_from(&self, origin: FileIdent, remote: FileIdent) -> bool {
        if self.local_file.is_coordinator() {
            origin == remote
        } else {
            !origin.is_local()
        }
    }

    /// The latest `remote`-side version acknowledged by the log prefix
    /// ending at `up_to`: the remote version of the newest entry at or
    /// before `up_to` that was received over the link to `remote`. Serve
    /// an entry with `up_to` at the current version: its reciprocal has
    /// already absorbed every changeset integrated from that link, so the
    /// receiver must only merge it against entries the sender has not
    /// seen.
    pub fn last_integrated_remote_version(&self, remote: FileIdent, up_to: Version) -> Version {
        let mut version = up_to.min(self.current_version());
        while version >= 2 {
            let entry = self.entry_at(version).unwrap();
            if self.received_from(entry.origin_file, remote) {
                return entry.remote_version;
            }
            version -= 1;
        }
        0
    }
}

/// Collapses redundant instructions in a changeset before merging.
///
/// Two conservative rules, both effect-preserving:
///
/// - When the changeset contains no list-structural or clear instruction,
///   only the last `Update` per path is kept (an earlier update on the
///   same path is unobservable once overwritten).
/// - A `CreateObject` followed by an `EraseObject` of the same object,
///   with no surviving reference to that object anywhere else in the
///   changeset, is dropped together with every instruction on the object
///   in between.
///
/// Merging a compacted batch must produce the same group as merging the
/// raw stream; the engine stays correct with compaction disabled.
pub fn compact(changeset: &mut Changeset) {
    collapse_updates(changeset);
    collapse_create_erase(changeset);
}

fn collapse_updates(changeset: &mut Changeset) {
    let structural = changeset.iter().any(|(_, i)| {
        i.is_list_structural() || matches!(i, Instruction::Clear { .. })
    });
    if structural {
        return;
    }
    let slots: Vec<usize> = changeset.iter().map(|(i, _)| i).collect();
    let mut discard = Vec::new();
    for (pos, &slot) in slots.iter().enumerate() {
        let instr = match changeset.get(slot) {
            Some(i) => i.clone(),
            None => continue,
        };
        let path = match &instr {
            // An accumulator changes how the update merges (it rebases
            // onto concurrent winners), so updates carrying one are
            // never collapsed away.
            Instruction::Update {
                path,
                prior_add: None,
                ..
            } => path.clone(),
            _ => continue,
        };
        for &later in &slots[pos + 1..] {
            if let Some(Instruction::Update { path: q, .. }) = changeset.get(later) {
                if *q == path {
                    discard.push(slot);
                    break;
                }
            }
        }
    }
    for slot in discard {
        changeset.discard(slot);
    }
}

fn collapse_create_erase(changeset: &mut Changeset) {
    loop {
        let mut cycle: Option<(usize, usize)> = None;
        'outer: for (slot, instr) in changeset.iter() {
            let (table, object) = match instr {
                // Pair keys are creator-unique, so a pair-keyed create is
                // always a fresh object; a primary-key create may be a
                // get-or-create of a pre-existing object and its erase
                // must survive.
                Instruction::CreateObject { table, object }
                    if matches!(object, crate::value::GlobalKey::Pair { .. }) =>
                {
                    (*table, object.clone())
                }
                _ => continue,
            };
            for (later, other) in changeset.iter() {
                if later <= slot {
                    continue;
                }
                match other {
                    Instruction::EraseObject { table: t, object: o }
                        if *t == table && *o == object =>
                    {
                        if !referenced_outside(changeset, slot, later, table, &object) {
                            cycle = Some((slot, later));
                            break 'outer;
                        }
                        break;
                    }
                    Instruction::CreateObject { table: t, object: o }
                        if *t == table && *o == object =>
                    {
                        break;
                    }
                    _ => {}
                }
            }
        }
        let (begin, end) = match cycle {
            Some(c) => c,
            None => return,
        };
        let table = changeset.get(begin).unwrap().table();
        let object = changeset.get(begin).unwrap().object().unwrap().clone();
        // The erase itself stays: applying it to an object that was never
        // created is a no-op that still writes the tombstone, so the
        // compacted and raw streams leave identical state behind.
        let doomed: Vec<usize> = changeset
            .iter()
            .filter(|(slot, instr)| {
                *slot >= begin
                    && *slot < end
                    && instr.table() == table
                    && instr.object() == Some(&object)
            })
            .map(|(slot, _)| slot)
            .collect();
        for slot in doomed {
            changeset.discard(slot);
        }
    }
}

fn referenced_outside(
    changeset: &Changeset,
    begin: usize,
    end: usize,
    table: crate::value::InternString,
    object: &crate::value::GlobalKey,
) -> bool {
    for (slot, instr) in changeset.iter() {
        let inside = slot >= begin && slot <= end;
        let on_object = instr.table() == table && instr.object() == Some(object);
        if on_object && !inside {
            return true;
        }
        let links_to = match instr {
            Instruction::Update { value, .. }
            | Instruction::ArrayInsert { value, .. }
            | Instruction::SetInsert { value, .. }
            | Instruction::SetErase { value, .. } => matches!(
                value,
                Payload::Link { target_table, target }
                    if *target_table == table && target == object
            ),
            _ => false,
        };
        if links_to {
            return true;
        }
    }
    false
}

/// Decodes a history entry or reciprocal back into a changeset, restoring
/// the metadata the byte form omits.
pub fn decode_entry(entry: &HistoryEntry, bytes: &[u8]) -> Result<Changeset> {
    let mut changeset = crate::codec::decode_changeset(bytes)?;
    changeset.version = entry.version;
    changeset.origin_file = entry.origin_file;
    changeset.origin_timestamp = entry.origin_timestamp;
    changeset.last_integrated_remote_version = entry.remote_version;
    Ok(changeset)
}
