//! Pairwise operational-transformation merge.
//!
//! `merge_changesets` walks a local history entry and an incoming remote
//! changeset with a cursor in each and merges every live pair. Both sides
//! mutate: the remote changeset becomes applicable on top of the local
//! state, and the local entry becomes the reciprocal transform that will
//! be served to the remote's origin.
//!
//! The walk is strictly in order and a discarded instruction stops
//! participating immediately. That discipline is load-bearing: cascades
//! (a surviving destroyer meets every later descendant from the other
//! side), idempotent cancellation (equal erases meet before anything
//! after them), and `prior_size` bookkeeping (an instruction only adjusts
//! sizes while it is alive) all fall out of it.

use crate::changeset::{Changeset, InternTable};
use crate::error::{Error, Result};
use crate::history::{decode_entry, SyncHistory};
use crate::id::{FileIdent, Timestamp, Version};
use crate::instruction::Instruction;
use crate::path::{classify, PathElem, PathRelation};
use crate::value::{ContainerKind, Payload, SentinelKind};

/// Tie-break key of one changeset: origin timestamp, then origin file
/// identity. File identities are unique, so the order is total.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MergeKey {
    /// Origin timestamp.
    pub timestamp: Timestamp,
    /// Effective origin file identity (local origin resolved to the
    /// peer's own identity).
    pub file: FileIdent,
}

/// Effective rank of a single instruction: default updates sort below
/// every concrete instruction and fall back to the real key among
/// themselves.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct EffKey {
    concrete: bool,
    key: MergeKey,
}

/// Counters for one pairwise merge, reported to the diagnostic sink.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeStats {
    /// Local-entry instructions discarded from the reciprocal.
    pub discarded_local: usize,
    /// Remote instructions discarded from the transformed changeset.
    pub discarded_remote: usize,
    /// Instructions rewritten on either side.
    pub rewritten: usize,
}

/// Diagnostic sink for transformer events. Reporting never affects merge
/// outcomes.
pub trait Reporter {
    /// Called after each (entry, incoming) merge.
    fn on_merge(&mut self, local_version: Version, remote_file: FileIdent, stats: &MergeStats) {
        let _ = (local_version, remote_file, stats);
    }
}

enum Fate {
    Keep,
    Replace(Instruction),
    Discard,
}

struct Outcome {
    left: Fate,
    right: Fate,
}

impl Outcome {
    fn keep() -> Self {
        Outcome {
            left: Fate::Keep,
            right: Fate::Keep,
        }
    }
}

/// Drives the transform step of integration: for each incoming remote
/// changeset, merges it against the concurrent window of local history
/// entries and records updated reciprocal transforms.
pub struct Transformer<'a> {
    history: &'a mut SyncHistory,
    reporter: Option<&'a mut dyn Reporter>,
}

impl<'a> Transformer<'a> {
    /// Creates a transformer over the local history.
    pub fn new(history: &'a mut SyncHistory) -> Self {
        Self {
            history,
            reporter: None,
        }
    }

    /// Attaches a diagnostic reporter.
    pub fn with_reporter(history: &'a mut SyncHistory, reporter: &'a mut dyn Reporter) -> Self {
        Self {
            history,
            reporter: Some(reporter),
        }
    }

    /// Transforms `incoming` against every concurrent local entry, in
    /// ascending version order. On return the changeset is safe to apply
    /// to the current local state, and every touched entry's reciprocal
    /// for the remote origin has been updated (empty reciprocals are
    /// stored as zero bytes).
    pub fn transform_remote_changeset(&mut self, incoming: &mut Changeset) -> Result<()> {
        let origin = incoming.origin_file;
        // Reciprocals accumulate per direct link: the coordinator keeps
        // one per peer, a regular peer keeps one stream for everything
        // arriving through the coordinator, whatever the origin tag says.
        let link = if self.history.local_file().is_coordinator() {
            origin
        } else {
            FileIdent::COORDINATOR
        };
        let current = self.history.current_version();
        let right_key = MergeKey {
            timestamp: incoming.origin_timestamp,
            file: origin,
        };
        let mut begin = incoming.last_integrated_remote_version;
        loop {
            let version = self.history.find_next(begin, current, origin, false);
            if version == 0 {
                return Ok(());
            }
            let entry_bytes = self.history.reciprocal(link, version).to_vec();
            let entry = self.history.entry_at(version).unwrap();
            let mut reciprocal = decode_entry(entry, &entry_bytes)?;
            let left_file = if entry.origin_file.is_local() {
                self.history.local_file()
            } else {
                entry.origin_file
            };
            let left_key = MergeKey {
                timestamp: entry.origin_timestamp,
                file: left_file,
            };
            let stats = merge_changesets(&mut reciprocal, left_key, incoming, right_key)?;
            if let Some(reporter) = self.reporter.as_deref_mut() {
                reporter.on_merge(version, origin, &stats);
            }
            let mut bytes = Vec::new();
            if !reciprocal.is_empty() {
                crate::codec::encode_changeset(&reciprocal, &mut bytes);
            }
            self.history.set_reciprocal(link, version, bytes);
            begin = version;
        }
    }
}

/// Merges a local entry (`left`, becoming the reciprocal) against an
/// incoming remote changeset (`right`, becoming the applicable form).
pub fn merge_changesets(
    left: &mut Changeset,
    left_key: MergeKey,
    right: &mut Changeset,
    right_key: MergeKey,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    for li in 0..left.num_slots() {
        if left.get(li).is_none() {
            continue;
        }
        for ri in 0..right.num_slots() {
            if right.get(ri).is_none() {
                continue;
            }
            merge_pair(left, li, left_key, right, ri, right_key, &mut stats)?;
            if left.get(li).is_none() {
                break;
            }
        }
    }
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn merge_pair(
    left: &mut Changeset,
    li: usize,
    left_key: MergeKey,
    right: &mut Changeset,
    ri: usize,
    right_key: MergeKey,
    stats: &mut MergeStats,
) -> Result<()> {
    let l = left.get(li).unwrap().clone();
    let r = right.get(ri).unwrap().clone();
    let outcome = decide(
        &l,
        left.strings(),
        left_key,
        &r,
        right.strings(),
        right_key,
        ri,
    )?;
    match outcome.left {
        Fate::Keep => {}
        Fate::Replace(instruction) => {
            tracing::trace!(slot = li, ?instruction, "rewrite left");
            stats.rewritten += 1;
            left.set(li, instruction);
        }
        Fate::Discard => {
            tracing::trace!(slot = li, "discard left");
            stats.discarded_local += 1;
            left.discard(li);
        }
    }
    match outcome.right {
        Fate::Keep => {}
        Fate::Replace(instruction) => {
            tracing::trace!(slot = ri, ?instruction, "rewrite right");
            stats.rewritten += 1;
            right.set(ri, instruction);
        }
        Fate::Discard => {
            tracing::trace!(slot = ri, "discard right");
            stats.discarded_remote += 1;
            right.discard(ri);
        }
    }
    Ok(())
}

fn same_str(
    a: crate::value::InternString,
    at: &InternTable,
    b: crate::value::InternString,
    bt: &InternTable,
) -> bool {
    at.get(a) == bt.get(b)
}

/// True when the instruction touches the named table: by addressing it or
/// by carrying a link payload into it. Used by the table-erase cascade.
fn references_table(
    instruction: &Instruction,
    strings: &InternTable,
    table: crate::value::InternString,
    table_strings: &InternTable,
) -> bool {
    if same_str(instruction.table(), strings, table, table_strings) {
        return true;
    }
    let payload = match instruction {
        Instruction::Update { value, .. }
        | Instruction::ArrayInsert { value, .. }
        | Instruction::SetInsert { value, .. }
        | Instruction::SetErase { value, .. } => Some(value),
        _ => None,
    };
    matches!(
        payload,
        Some(Payload::Link { target_table, .. })
            if same_str(*target_table, strings, table, table_strings)
    )
}

fn touches_object(
    instruction: &Instruction,
    strings: &InternTable,
    table: crate::value::InternString,
    object: &crate::value::GlobalKey,
    object_strings: &InternTable,
) -> bool {
    if !same_str(instruction.table(), strings, table, object_strings) {
        return false;
    }
    match instruction.object() {
        Some(key) => key.eq_in(strings, object, object_strings),
        None => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn decide(
    l: &Instruction,
    lt: &InternTable,
    lkey: MergeKey,
    r: &Instruction,
    rt: &InternTable,
    rkey: MergeKey,
    ri: usize,
) -> Result<Outcome> {
    use Instruction::*;

    // Schema pairs come first: table- and column-level conflicts override
    // any path reasoning.
    match (l, r) {
        (AddTable { table: a, ty: ta }, AddTable { table: b, ty: tb }) => {
            if same_str(*a, lt, *b, rt) {
                if !ta.eq_in(lt, tb, rt) {
                    return Err(Error::bad_schema(ri));
                }
                // Identical declarations are idempotent at apply time.
            }
            return Ok(Outcome::keep());
        }
        (EraseTable { table: a }, EraseTable { table: b }) => {
            if same_str(*a, lt, *b, rt) {
                return Ok(discard_lower(lkey, rkey));
            }
            return Ok(Outcome::keep());
        }
        (AddTable { table: a, .. }, EraseTable { table: b })
        | (EraseTable { table: a }, AddTable { table: b, .. }) => {
            if same_str(*a, lt, *b, rt) {
                return Ok(discard_lower(lkey, rkey));
            }
            return Ok(Outcome::keep());
        }
        (EraseTable { table }, _) => {
            if references_table(r, rt, *table, lt) {
                return Ok(Outcome {
                    left: Fate::Keep,
                    right: Fate::Discard,
                });
            }
            return Ok(Outcome::keep());
        }
        (_, EraseTable { table }) => {
            if references_table(l, lt, *table, rt) {
                return Ok(Outcome {
                    left: Fate::Discard,
                    right: Fate::Keep,
                });
            }
            return Ok(Outcome::keep());
        }
        (
            AddColumn {
                table: ta,
                field: fa,
                spec: sa,
            },
            AddColumn {
                table: tb,
                field: fb,
                spec: sb,
            },
        ) => {
            if same_str(*ta, lt, *tb, rt) && same_str(*fa, lt, *fb, rt) && !sa.eq_in(lt, sb, rt) {
                return Err(Error::bad_schema(ri));
            }
            return Ok(Outcome::keep());
        }
        (
            EraseColumn {
                table: ta,
                field: fa,
            },
            EraseColumn {
                table: tb,
                field: fb,
            },
        ) => {
            if same_str(*ta, lt, *tb, rt) && same_str(*fa, lt, *fb, rt) {
                return Ok(discard_lower(lkey, rkey));
            }
            return Ok(Outcome::keep());
        }
        (
            AddColumn {
                table: ta,
                field: fa,
                ..
            },
            EraseColumn {
                table: tb,
                field: fb,
            },
        )
        | (
            EraseColumn {
                table: ta,
                field: fa,
            },
            AddColumn {
                table: tb,
                field: fb,
                ..
            },
        ) => {
            if same_str(*ta, lt, *tb, rt) && same_str(*fa, lt, *fb, rt) {
                return Ok(discard_lower(lkey, rkey));
            }
            return Ok(Outcome::keep());
        }
        (EraseColumn { table, field }, _) => {
            let on_column = r.path().map_or(false, |p| {
                same_str(p.table, rt, *table, lt) && same_str(p.field, rt, *field, lt)
            });
            if on_column {
                return Ok(Outcome {
                    left: Fate::Keep,
                    right: Fate::Discard,
                });
            }
            return Ok(Outcome::keep());
        }
        (_, EraseColumn { table, field }) => {
            let on_column = l.path().map_or(false, |p| {
                same_str(p.table, lt, *table, rt) && same_str(p.field, lt, *field, rt)
            });
            if on_column {
                return Ok(Outcome {
                    left: Fate::Discard,
                    right: Fate::Keep,
                });
            }
            return Ok(Outcome::keep());
        }
        (AddTable { .. }, _)
        | (_, AddTable { .. })
        | (AddColumn { .. }, _)
        | (_, AddColumn { .. }) => return Ok(Outcome::keep()),
        _ => {}
    }

    // Object lifecycle. A surviving erase beats every other instruction
    // on its object; among lifecycle instructions the higher key wins, so
    // the highest-timestamp final create of a create-erase-create cycle
    // survives with the object identity intact.
    match (l, r) {
        // Creation is get-or-create: two creates of the same key build
        // the same object.
        (CreateObject { .. }, CreateObject { .. }) => return Ok(Outcome::keep()),
        (
            EraseObject {
                table: ta,
                object: oa,
            },
            EraseObject {
                table: tb,
                object: ob,
            },
        ) => {
            if same_str(*ta, lt, *tb, rt) && oa.eq_in(lt, ob, rt) {
                return Ok(discard_lower(lkey, rkey));
            }
            return Ok(Outcome::keep());
        }
        (
            CreateObject {
                table: ta,
                object: oa,
            },
            EraseObject {
                table: tb,
                object: ob,
            },
        )
        | (
            EraseObject {
                table: ta,
                object: oa,
            },
            CreateObject {
                table: tb,
                object: ob,
            },
        ) => {
            if same_str(*ta, lt, *tb, rt) && oa.eq_in(lt, ob, rt) {
                return Ok(discard_lower(lkey, rkey));
            }
            return Ok(Outcome::keep());
        }
        (EraseObject { table, object }, _) => {
            if touches_object(r, rt, *table, object, lt) {
                return Ok(Outcome {
                    left: Fate::Keep,
                    right: Fate::Discard,
                });
            }
            return Ok(Outcome::keep());
        }
        (_, EraseObject { table, object }) => {
            if touches_object(l, lt, *table, object, rt) {
                return Ok(Outcome {
                    left: Fate::Discard,
                    right: Fate::Keep,
                });
            }
            return Ok(Outcome::keep());
        }
        (CreateObject { .. }, _) | (_, CreateObject { .. }) => return Ok(Outcome::keep()),
        _ => {}
    }

    // Everything left carries a path.
    let lp = l.path().unwrap();
    let rp = r.path().unwrap();
    match classify(lp, lt, rp, rt) {
        PathRelation::Disjoint => Ok(Outcome::keep()),
        PathRelation::Same => decide_same_path(l, lt, lkey, r, rt, rkey),
        PathRelation::LeftPrefixOfRight => Ok(decide_prefix(l, r, true)),
        PathRelation::RightPrefixOfLeft => Ok(decide_prefix(r, l, false)),
        PathRelation::DivergeAtIndex {
            depth,
            left_index,
            right_index,
        } => Ok(decide_diverging(
            l,
            lkey,
            r,
            rkey,
            depth,
            left_index,
            right_index,
        )),
    }
}

fn discard_lower(lkey: MergeKey, rkey: MergeKey) -> Outcome {
    if lkey > rkey {
        Outcome {
            left: Fate::Keep,
            right: Fate::Discard,
        }
    } else {
        Outcome {
            left: Fate::Discard,
            right: Fate::Keep,
        }
    }
}

/// Same full path: register writes, integer additions, clears, set
/// elements, and equal-index list structure.
fn decide_same_path(
    l: &Instruction,
    lt: &InternTable,
    lkey: MergeKey,
    r: &Instruction,
    rt: &InternTable,
    rkey: MergeKey,
) -> Result<Outcome> {
    use Instruction::*;
    Ok(match (l, r) {
        (Update { .. }, Update { .. }) => register(l, lt, lkey, r, rt, rkey),
        (Update { .. }, AddInteger { delta, .. }) => {
            add_vs_update(l, lkey, *delta, rkey, true)
        }
        (AddInteger { delta, .. }, Update { .. }) => {
            add_vs_update(r, rkey, *delta, lkey, false)
        }
        (AddInteger { .. }, AddInteger { .. }) => Outcome::keep(),
        (Clear { .. }, Clear { .. }) => discard_lower(lkey, rkey),
        (
            Update { value, is_default, .. },
            Clear { collection, .. },
        ) => update_vs_clear(*is_default, value, *collection, true),
        (
            Clear { collection, .. },
            Update { value, is_default, .. },
        ) => update_vs_clear(*is_default, value, *collection, false),
        // A clear of the container discards concurrent element
        // operations from the other side regardless of their keys; only
        // another clear competes by key.
        (Clear { .. }, SetInsert { .. } | SetErase { .. } | AddInteger { .. }) => Outcome {
            left: Fate::Keep,
            right: Fate::Discard,
        },
        (SetInsert { .. } | SetErase { .. } | AddInteger { .. }, Clear { .. }) => Outcome {
            left: Fate::Discard,
            right: Fate::Keep,
        },
        (SetInsert { value: a, .. }, SetInsert { value: b, .. }) => {
            if a.eq_in(lt, b, rt) {
                // Idempotent: the same element inserted on both sides.
                discard_lower(lkey, rkey)
            } else {
                Outcome::keep()
            }
        }
        (SetInsert { value: a, .. }, SetErase { value: b, .. })
        | (SetErase { value: a, .. }, SetInsert { value: b, .. }) => {
            if a.eq_in(lt, b, rt) {
                discard_lower(lkey, rkey)
            } else {
                Outcome::keep()
            }
        }
        (SetErase { value: a, .. }, SetErase { value: b, .. }) => {
            if a.eq_in(lt, b, rt) {
                // Both sides erased the element already.
                Outcome {
                    left: Fate::Discard,
                    right: Fate::Discard,
                }
            } else {
                Outcome::keep()
            }
        }
        // A whole-container overwrite at the same path as set operations:
        // the surviving write destroys the set, except that a default
        // write never destroys concrete structural activity.
        (Update { is_default, .. }, SetInsert { .. } | SetErase { .. }) => {
            destroyer_vs_collection_op(*is_default, true)
        }
        (SetInsert { .. } | SetErase { .. }, Update { is_default, .. }) => {
            destroyer_vs_collection_op(*is_default, false)
        }
        (
            ArrayInsert { .. } | ArrayMove { .. } | ArrayErase { .. },
            ArrayInsert { .. } | ArrayMove { .. } | ArrayErase { .. },
        ) => merge_list_ops(l, lkey, r, rkey),
        // Element write versus structure of the same element.
        (Update { .. } | AddInteger { .. }, ArrayInsert { .. }) => {
            let mut l2 = l.clone();
            bump_last_index(&mut l2, 1);
            Outcome {
                left: Fate::Replace(l2),
                right: Fate::Keep,
            }
        }
        (ArrayInsert { .. }, Update { .. } | AddInteger { .. }) => {
            let mut r2 = r.clone();
            bump_last_index(&mut r2, 1);
            Outcome {
                left: Fate::Keep,
                right: Fate::Replace(r2),
            }
        }
        (Update { .. } | AddInteger { .. }, ArrayErase { .. }) => Outcome {
            left: Fate::Discard,
            right: Fate::Keep,
        },
        (ArrayErase { .. }, Update { .. } | AddInteger { .. }) => Outcome {
            left: Fate::Keep,
            right: Fate::Discard,
        },
        (Update { .. } | AddInteger { .. }, ArrayMove { to, .. }) => {
            let mut l2 = l.clone();
            set_last_index(&mut l2, *to);
            Outcome {
                left: Fate::Replace(l2),
                right: Fate::Keep,
            }
        }
        (ArrayMove { to, .. }, Update { .. } | AddInteger { .. }) => {
            let mut r2 = r.clone();
            set_last_index(&mut r2, *to);
            Outcome {
                left: Fate::Keep,
                right: Fate::Replace(r2),
            }
        }
        // Remaining same-path combinations are shape-incoherent (for
        // example a set insert against a list erase); they cannot both be
        // well-typed and the applier rejects whichever is wrong.
        _ => Outcome::keep(),
    })
}

fn destroyer_vs_collection_op(update_is_default: bool, update_is_left: bool) -> Outcome {
    let (update_fate, op_fate) = if update_is_default {
        (Fate::Discard, Fate::Keep)
    } else {
        (Fate::Keep, Fate::Discard)
    };
    if update_is_left {
        Outcome {
            left: update_fate,
            right: op_fate,
        }
    } else {
        Outcome {
            left: op_fate,
            right: update_fate,
        }
    }
}

fn update_vs_clear(
    update_is_default: bool,
    value: &Payload,
    collection: ContainerKind,
    update_is_left: bool,
) -> Outcome {
    if !value.is_scalar() {
        let compatible = matches!(
            (value.sentinel_kind(), collection),
            (Some(SentinelKind::List), ContainerKind::List)
                | (Some(SentinelKind::Dictionary), ContainerKind::Dictionary)
        );
        if compatible {
            // Same-kind sentinel re-asserts the container; the clear
            // still applies to it.
            return Outcome::keep();
        }
    }
    destroyer_vs_collection_op(update_is_default, update_is_left)
}

/// LWW register on one slot. Same-kind container sentinels are
/// idempotent; otherwise the higher effective key wins and the loser is
/// discarded, accumulator and all. An accumulator is only ever a
/// merge-derived copy of a live `AddInteger`; the winner picks the
/// addition up again when it meets that instruction, so migrating the
/// loser's copy would count it twice.
fn register(
    l: &Instruction,
    _lt: &InternTable,
    lkey: MergeKey,
    r: &Instruction,
    _rt: &InternTable,
    rkey: MergeKey,
) -> Outcome {
    let (lv, ld) = match l {
        Instruction::Update {
            value, is_default, ..
        } => (value, *is_default),
        _ => unreachable!("register on non-update"),
    };
    let (rv, rd) = match r {
        Instruction::Update {
            value, is_default, ..
        } => (value, *is_default),
        _ => unreachable!("register on non-update"),
    };
    if let (Some(a), Some(b)) = (lv.sentinel_kind(), rv.sentinel_kind()) {
        if a == b {
            // Both sides converted the slot to the same container kind;
            // descendants from both sides merge into it.
            return Outcome::keep();
        }
    }
    let lk = EffKey {
        concrete: !ld,
        key: lkey,
    };
    let rk = EffKey {
        concrete: !rd,
        key: rkey,
    };
    if lk > rk {
        Outcome {
            left: Fate::Keep,
            right: Fate::Discard,
        }
    } else {
        Outcome {
            left: Fate::Discard,
            right: Fate::Keep,
        }
    }
}

/// An integer addition against a slot write on the same path. The add
/// survives and folds into the update's accumulator unless the slot is
/// taken away from under it (null or tombstone) at a greater key.
fn add_vs_update(
    update: &Instruction,
    update_key: MergeKey,
    delta: i64,
    add_key: MergeKey,
    update_is_left: bool,
) -> Outcome {
    let (value, is_default) = match update {
        Instruction::Update {
            value, is_default, ..
        } => (value, *is_default),
        _ => unreachable!("add_vs_update on non-update"),
    };
    let uk = EffKey {
        concrete: !is_default,
        key: update_key,
    };
    let ak = EffKey {
        concrete: true,
        key: add_key,
    };
    let nullifies = matches!(value, Payload::Null | Payload::Erased);
    if nullifies && uk > ak {
        // The target became null after the addition; the addition is
        // gone for good.
        let (update_fate, add_fate) = (Fate::Keep, Fate::Discard);
        return orient(update_fate, add_fate, update_is_left);
    }
    let mut u = update.clone();
    if let Instruction::Update { prior_add, .. } = &mut u {
        *prior_add = Some(prior_add.unwrap_or(0).wrapping_add(delta));
    }
    orient(Fate::Replace(u), Fate::Keep, update_is_left)
}

fn orient(update_fate: Fate, add_fate: Fate, update_is_left: bool) -> Outcome {
    if update_is_left {
        Outcome {
            left: update_fate,
            right: add_fate,
        }
    } else {
        Outcome {
            left: add_fate,
            right: update_fate,
        }
    }
}

/// One path is a strict prefix of the other: the shorter instruction
/// addresses a container (or slot) the longer one lives inside.
/// `prefix_is_left` orients the returned outcome.
fn decide_prefix(prefix: &Instruction, descendant: &Instruction, prefix_is_left: bool) -> Outcome {
    let keep = Outcome::keep();
    let prefix_len = prefix.path().unwrap().suffix.len();
    let outcome = match prefix {
        Instruction::Update {
            value, is_default, ..
        } => {
            let descent = &descendant.path().unwrap().suffix[prefix_len];
            let compatible = matches!(
                (value.sentinel_kind(), descent),
                (Some(SentinelKind::List), PathElem::Index(_))
                    | (Some(SentinelKind::Dictionary), PathElem::Field(_))
                    | (Some(SentinelKind::Embedded), PathElem::Field(_))
            );
            if compatible {
                keep
            } else if *is_default {
                // A default write ranks earliest of all and never
                // destroys concrete structure under the slot.
                oriented(Fate::Discard, Fate::Keep, prefix_is_left)
            } else {
                // Scalar, null, tombstone, or a different container kind:
                // whatever the descendant addressed no longer exists.
                // Key comparison already happened at the slot register;
                // higher up in the path wins here.
                oriented(Fate::Keep, Fate::Discard, prefix_is_left)
            }
        }
        Instruction::Clear { .. } => oriented(Fate::Keep, Fate::Discard, prefix_is_left),
        Instruction::ArrayInsert { .. } => {
            // The descendant passes through the insertion point; classify
            // put it at the same index, so the old occupant shifted up.
            let mut d = descendant.clone();
            if let Some(p) = d.path_mut() {
                if let Some(i) = p.index_at(prefix_len - 1) {
                    p.set_index_at(prefix_len - 1, i + 1);
                }
            }
            oriented(Fate::Keep, Fate::Replace(d), prefix_is_left)
        }
        Instruction::ArrayErase { .. } => {
            // The element the descendant lives under is gone, and so is
            // everything the descendant would have done to it.
            oriented(Fate::Keep, Fate::Discard, prefix_is_left)
        }
        Instruction::ArrayMove { to, .. } => {
            let mut d = descendant.clone();
            if let Some(p) = d.path_mut() {
                p.set_index_at(prefix_len - 1, *to);
            }
            oriented(Fate::Keep, Fate::Replace(d), prefix_is_left)
        }
        _ => keep,
    };
    outcome
}

fn oriented(prefix_fate: Fate, descendant_fate: Fate, prefix_is_left: bool) -> Outcome {
    if prefix_is_left {
        Outcome {
            left: prefix_fate,
            right: descendant_fate,
        }
    } else {
        Outcome {
            left: descendant_fate,
            right: prefix_fate,
        }
    }
}

/// The paths diverge at a list index. When a side's instruction is list
/// structure whose own index is the divergence point, the other side's
/// index there shifts; when both are, the full list matrix applies.
fn decide_diverging(
    l: &Instruction,
    lkey: MergeKey,
    r: &Instruction,
    rkey: MergeKey,
    depth: usize,
    left_index: u32,
    right_index: u32,
) -> Outcome {
    let l_structural =
        l.is_list_structural() && l.path().unwrap().suffix.len() == depth + 1;
    let r_structural =
        r.is_list_structural() && r.path().unwrap().suffix.len() == depth + 1;
    match (l_structural, r_structural) {
        (true, true) => merge_list_ops(l, lkey, r, rkey),
        (true, false) => {
            let fate = shift_descendant(l, r, depth, left_index, right_index);
            Outcome {
                left: Fate::Keep,
                right: fate,
            }
        }
        (false, true) => {
            let fate = shift_descendant(r, l, depth, right_index, left_index);
            Outcome {
                left: fate,
                right: Fate::Keep,
            }
        }
        (false, false) => Outcome::keep(),
    }
}

/// Shifts (or discards) a descendant that passes through the list a
/// structural op mutated. `op_index` is the structural op's own index,
/// `descendant_index` the descendant's index at the same depth; they
/// differ here.
fn shift_descendant(
    op: &Instruction,
    descendant: &Instruction,
    depth: usize,
    op_index: u32,
    descendant_index: u32,
) -> Fate {
    let new_index = match op {
        Instruction::ArrayInsert { .. } => {
            if op_index < descendant_index {
                Some(descendant_index + 1)
            } else {
                None
            }
        }
        Instruction::ArrayErase { .. } => {
            if op_index < descendant_index {
                Some(descendant_index - 1)
            } else {
                // op_index == descendant_index was the prefix case; here
                // the erase is below the descendant's position.
                None
            }
        }
        Instruction::ArrayMove { to, .. } => {
            let after_erase = if op_index < descendant_index {
                descendant_index - 1
            } else {
                descendant_index
            };
            let after_insert = if *to <= after_erase {
                after_erase + 1
            } else {
                after_erase
            };
            if after_insert != descendant_index {
                Some(after_insert)
            } else {
                None
            }
        }
        _ => None,
    };
    match new_index {
        None => Fate::Keep,
        Some(i) => {
            let mut d = descendant.clone();
            if let Some(p) = d.path_mut() {
                p.set_index_at(depth, i);
            }
            Fate::Replace(d)
        }
    }
}

fn bump_last_index(instruction: &mut Instruction, by: u32) {
    if let Some(p) = instruction.path_mut() {
        if let Some(i) = p.last_index() {
            p.set_last_index(i + by);
        }
    }
}

fn set_last_index(instruction: &mut Instruction, to: u32) {
    if let Some(p) = instruction.path_mut() {
        p.set_last_index(to);
    }
}

fn bump_prior(instruction: &mut Instruction, delta: i64) {
    match instruction {
        Instruction::ArrayInsert { prior_size, .. }
        | Instruction::ArrayErase { prior_size, .. } => {
            *prior_size = (*prior_size as i64 + delta) as u32;
        }
        _ => {}
    }
}

fn size_delta(instruction: &Instruction) -> i64 {
    match instruction {
        Instruction::ArrayInsert { .. } => 1,
        Instruction::ArrayErase { .. } => -1,
        _ => 0,
    }
}

/// The list matrix: two structural operations on the same list. Equal
/// inserts put the higher key first, equal erases cancel, and moves
/// decompose into erase plus insert with shifts applied in that order;
/// each surviving instruction's `prior_size` absorbs the other side's
/// net size change.
fn merge_list_ops(l: &Instruction, lkey: MergeKey, r: &Instruction, rkey: MergeKey) -> Outcome {
    use Instruction::*;
    let li = l.path().unwrap().last_index().unwrap();
    let ri = r.path().unwrap().last_index().unwrap();
    let mut l2 = l.clone();
    let mut r2 = r.clone();
    let mut discard_left = false;
    let mut discard_right = false;
    match (l, r) {
        (ArrayInsert { .. }, ArrayInsert { .. }) => {
            if li < ri || (li == ri && lkey > rkey) {
                set_last_index(&mut r2, ri + 1);
            } else {
                set_last_index(&mut l2, li + 1);
            }
        }
        (ArrayInsert { .. }, ArrayErase { .. }) => {
            if li <= ri {
                set_last_index(&mut r2, ri + 1);
            } else {
                set_last_index(&mut l2, li - 1);
            }
        }
        (ArrayErase { .. }, ArrayInsert { .. }) => {
            if ri <= li {
                set_last_index(&mut l2, li + 1);
            } else {
                set_last_index(&mut r2, ri - 1);
            }
        }
        (ArrayErase { .. }, ArrayErase { .. }) => {
            if li < ri {
                set_last_index(&mut r2, ri - 1);
            } else if li > ri {
                set_last_index(&mut l2, li - 1);
            } else {
                // The same element erased on both sides: both already
                // happened, neither travels.
                discard_left = true;
                discard_right = true;
            }
        }
        (ArrayMove { to, .. }, ArrayInsert { .. }) => {
            let from = li;
            let to = *to;
            // Transform the insert through erase(from), insert(to).
            let mut i = ri;
            if from < i {
                i -= 1;
            }
            if to <= i {
                i += 1;
            }
            set_last_index(&mut r2, i);
            // Transform the move through the insert.
            let from2 = if ri <= from { from + 1 } else { from };
            let to2 = if ri <= to { to + 1 } else { to };
            set_last_index(&mut l2, from2);
            if let ArrayMove { to, .. } = &mut l2 {
                *to = to2;
            }
        }
        (ArrayInsert { .. }, ArrayMove { to, .. }) => {
            let from = ri;
            let to = *to;
            let mut i = li;
            if from < i {
                i -= 1;
            }
            if to <= i {
                i += 1;
            }
            set_last_index(&mut l2, i);
            let from2 = if li <= from { from + 1 } else { from };
            let to2 = if li <= to { to + 1 } else { to };
            set_last_index(&mut r2, from2);
            if let ArrayMove { to, .. } = &mut r2 {
                *to = to2;
            }
        }
        (ArrayMove { to, .. }, ArrayErase { .. }) => {
            let to = *to;
            if ri == li {
                // The other side erased the element being moved; the
                // erase follows it to its destination.
                discard_left = true;
                set_last_index(&mut r2, to);
            } else {
                let from2 = if ri < li { li - 1 } else { li };
                let to2 = if ri < to { to - 1 } else { to };
                set_last_index(&mut l2, from2);
                if let ArrayMove { to, .. } = &mut l2 {
                    *to = to2;
                }
                let mut i = ri;
                if li < i {
                    i -= 1;
                }
                if to2 <= i {
                    i += 1;
                }
                set_last_index(&mut r2, i);
            }
        }
        (ArrayErase { .. }, ArrayMove { to, .. }) => {
            let to = *to;
            if li == ri {
                discard_right = true;
                set_last_index(&mut l2, to);
            } else {
                let from2 = if li < ri { ri - 1 } else { ri };
                let to2 = if li < to { to - 1 } else { to };
                set_last_index(&mut r2, from2);
                if let ArrayMove { to, .. } = &mut r2 {
                    *to = to2;
                }
                let mut i = li;
                if ri < i {
                    i -= 1;
                }
                if to2 <= i {
                    i += 1;
                }
                set_last_index(&mut l2, i);
            }
        }
        (ArrayMove { to: lto, .. }, ArrayMove { to: rto, .. }) => {
            if li == ri {
                // Same element moved twice: the higher key's destination
                // stands.
                if lkey > rkey {
                    discard_right = true;
                    set_last_index(&mut l2, *rto);
                } else {
                    discard_left = true;
                    set_last_index(&mut r2, *lto);
                }
            } else {
                let lfrom = if ri < li { li - 1 } else { li };
                let lto2 = if ri < *lto { lto - 1 } else { *lto };
                set_last_index(&mut l2, if *rto <= lfrom { lfrom + 1 } else { lfrom });
                if let ArrayMove { to, .. } = &mut l2 {
                    *to = if *rto <= lto2 { lto2 + 1 } else { lto2 };
                }
                let rfrom = if li < ri { ri - 1 } else { ri };
                let rto2 = if li < *rto { rto - 1 } else { *rto };
                set_last_index(&mut r2, if *lto <= rfrom { rfrom + 1 } else { rfrom });
                if let ArrayMove { to, .. } = &mut r2 {
                    *to = if *lto <= rto2 { rto2 + 1 } else { rto2 };
                }
            }
        }
        _ => unreachable!("merge_list_ops on non-structural pair"),
    }
    if !discard_left && !discard_right {
        bump_prior(&mut l2, size_delta(r));
        bump_prior(&mut r2, size_delta(l));
    }
    Outcome {
        left: if discard_left {
            Fate::Discard
        } else {
            Fate::Replace(l2)
        },
        right: if discard_right {
            Fate::Discard
        } else {
            Fate::Replace(r2)
        },
    }
}
