use crate::id::{FileIdent, Timestamp, Version};
use crate::instruction::Instruction;
use crate::path::Path;
use crate::value::InternString;
use fnv::FnvHashMap;
use std::fmt;

/// Per-changeset string deduplication table.
///
/// Table names, field names, and string payloads are stored once and
/// referenced by index. Indices are local to the owning changeset.
#[derive(Clone, Default, PartialEq)]
pub struct InternTable {
    strings: Vec<String>,
    index: FnvHashMap<String, u32>,
}

impl InternTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its index. Repeated interning of equal
    /// content returns the same index.
    pub fn intern(&mut self, s: &str) -> InternString {
        if let Some(&i) = self.index.get(s) {
            return InternString::new(i);
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        InternString::new(i)
    }

    /// Resolves an index. The index must come from this table; decode
    /// validates wire indices before they reach here.
    pub fn get(&self, s: InternString) -> &str {
        &self.strings[s.index() as usize]
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// True if nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Iterates the strings in index order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(|s| s.as_str())
    }
}

impl fmt::Debug for InternTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.strings.iter()).finish()
    }
}

/// An ordered sequence of instructions with version metadata and an
/// interning table.
///
/// Instructions live in stable slots: a transform may rewrite an
/// instruction in place or null its slot out, but never insert or delete
/// at arbitrary positions, so concurrent cursors into the sequence stay
/// valid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Changeset {
    slots: Vec<Option<Instruction>>,
    strings: InternTable,
    /// Version this changeset produced at its origin.
    pub version: Version,
    /// Most recent receiver-side version integrated into the producing
    /// peer when this changeset was produced.
    pub last_integrated_remote_version: Version,
    /// Producing peer's file identity; 0 means this peer.
    pub origin_file: FileIdent,
    /// Producing peer's timestamp, the primary tie-break key.
    pub origin_timestamp: Timestamp,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// The interning table.
    pub fn strings(&self) -> &InternTable {
        &self.strings
    }

    /// Interns a string into this changeset's table.
    pub fn intern(&mut self, s: &str) -> InternString {
        self.strings.intern(s)
    }

    /// Resolves an interned index.
    pub fn lookup(&self, s: InternString) -> &str {
        self.strings.get(s)
    }

    /// Appends an instruction.
    ///
    /// Consecutive `AddInteger`s on the same path collapse into one by
    /// summing their deltas. Adds are otherwise kept standalone: the
    /// `Update` accumulator is produced by the merge (a surviving add
    /// rides the paired update so it reapplies on the winning value), not
    /// by the builder. Pushing an `Update` drops the accumulator of an
    /// earlier update at the same path, which the overwrite supersedes.
    pub fn push(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::AddInteger { path, delta } => {
                for slot in self.slots.iter_mut().rev() {
                    match slot {
                        Some(Instruction::AddInteger { path: p, delta: d }) if *p == path => {
                            *d = d.wrapping_add(delta);
                            return;
                        }
                        Some(other) if other.path() == Some(&path) => break,
                        _ => {}
                    }
                }
                self.slots.push(Some(Instruction::AddInteger { path, delta }));
            }
            Instruction::Update {
                path,
                value,
                is_default,
                prior_add,
            } => {
                for slot in self.slots.iter_mut().rev() {
                    if let Some(Instruction::Update {
                        path: p,
                        prior_add: acc,
                        ..
                    }) = slot
                    {
                        if *p == path {
                            *acc = None;
                            break;
                        }
                    }
                }
                self.slots.push(Some(Instruction::Update {
                    path,
                    value,
                    is_default,
                    prior_add,
                }));
            }
            other => self.slots.push(Some(other)),
        }
    }

    /// Appends an instruction without collapsing. The codec uses this so
    /// a decoded changeset reproduces its wire form bit-exactly.
    pub fn push_raw(&mut self, instruction: Instruction) {
        self.slots.push(Some(instruction));
    }

    /// Number of slots, including discarded ones.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// True if no live instruction remains.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// The live instruction at `slot`, if any.
    pub fn get(&self, slot: usize) -> Option<&Instruction> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Mutable access to the live instruction at `slot`.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Instruction> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Replaces the instruction at `slot` in place.
    pub fn set(&mut self, slot: usize, instruction: Instruction) {
        self.slots[slot] = Some(instruction);
    }

    /// Nulls out the slot; the instruction stops participating in merges
    /// and is skipped by iteration and encoding.
    pub fn discard(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    /// Iterates live instructions in insertion order with their slot
    /// numbers. The fundamental consumption pattern.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Instruction)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|instr| (i, instr)))
    }

    /// Applies a visitor to every path in every live instruction.
    pub fn rewrite_paths<F: FnMut(&mut Path)>(&mut self, mut visitor: F) {
        for slot in self.slots.iter_mut() {
            if let Some(instr) = slot {
                if let Some(path) = instr.path_mut() {
                    visitor(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{GlobalKey, Payload};

    fn update(cs: &mut Changeset, field: &str, value: i64) -> Instruction {
        let t = cs.intern("t");
        let f = cs.intern(field);
        Instruction::Update {
            path: Path::field(t, GlobalKey::Int(1), f),
            value: Payload::Int(value),
            is_default: false,
            prior_add: None,
        }
    }

    #[test]
    fn push_collapses_consecutive_add_integers() {
        let mut cs = Changeset::new();
        let set = update(&mut cs, "i", 5);
        let path = set.path().unwrap().clone();
        cs.push(set);
        cs.push(Instruction::AddInteger {
            path: path.clone(),
            delta: 2,
        });
        cs.push(Instruction::AddInteger { path, delta: 3 });
        // The adds merge with each other but stay standalone after the
        // update; accumulators are a merge artifact, not a wire one.
        assert_eq!(cs.iter().count(), 2);
        match cs.get(1).unwrap() {
            Instruction::AddInteger { delta, .. } => assert_eq!(*delta, 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn later_update_supersedes_accumulator() {
        let mut cs = Changeset::new();
        let set = update(&mut cs, "i", 5);
        let path = set.path().unwrap().clone();
        cs.push(set);
        cs.push(Instruction::AddInteger { path, delta: 2 });
        let set9 = update(&mut cs, "i", 9);
        cs.push(set9);
        match cs.get(0).unwrap() {
            Instruction::Update { prior_add, .. } => assert_eq!(*prior_add, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn standalone_add_integer_is_kept() {
        let mut cs = Changeset::new();
        let t = cs.intern("t");
        let f = cs.intern("i");
        cs.push(Instruction::AddInteger {
            path: Path::field(t, GlobalKey::Int(1), f),
            delta: 4,
        });
        assert_eq!(cs.iter().count(), 1);
    }

    #[test]
    fn discard_keeps_slots_stable() {
        let mut cs = Changeset::new();
        let a = update(&mut cs, "a", 1);
        let b = update(&mut cs, "b", 2);
        cs.push(a);
        cs.push(b.clone());
        cs.discard(0);
        assert_eq!(cs.num_slots(), 2);
        assert_eq!(cs.iter().next(), Some((1, &b)));
        assert!(!cs.is_empty());
        cs.discard(1);
        assert!(cs.is_empty());
    }
}
