//! # Conflict resolution for a multi-peer synchronized object database
//!
//! Each peer of the database holds a local copy of a shared object graph,
//! records its mutations as fine-grained [`Instruction`]s grouped into
//! [`Changeset`]s, and exchanges them through a central coordinator. When
//! a peer receives remote instructions concurrent with its own
//! unacknowledged work, the incoming changesets are *transformed*
//! (operational transformation) so that applying them on top of the local
//! state yields the same graph every other peer converges to.
//!
//! ## Pieces
//!
//! - [`Instruction`] is a tagged variant covering schema changes, object
//!   lifecycle, scalar updates (with an integer-addition accumulator),
//!   list structure, dictionaries, and sets. Instructions address the
//!   graph through [`Path`]s and carry [`Payload`]s; the binary form is
//!   tag-byte plus LEB128 framing with a per-changeset interned-string
//!   table ([`encode_changeset`]/[`decode_changeset`]).
//! - [`SyncHistory`] is the append-only per-peer log of committed
//!   changesets. Besides the original bytes it stores, per remote peer,
//!   the *reciprocal transform*: the form a local changeset takes after
//!   merging against that remote's concurrent work, served on
//!   retransmission without re-running the merge.
//! - [`merge_changesets`] is the pairwise merge at the heart of the
//!   engine. Conflicts resolve by a total tie-break key (origin
//!   timestamp, then origin file identity); default writes rank earliest
//!   of all, clears beat concurrent element operations, destroyed
//!   containers take their descendants with them, and integer additions
//!   survive by rebasing onto whatever value wins the slot.
//! - [`apply_changeset`] executes a transformed changeset against a
//!   [`Group`], the crate's in-memory transactional object graph.
//! - [`Integrator`] ties it together for an inbound batch: transform,
//!   apply, append to history with the transformed bytes. Local writes
//!   skip the transform and are recorded with origin 0.
//!
//! ## Convergence
//!
//! Every merge rule commutes under the tie-break key, so all peers reach
//! a bit-identical group no matter which order the coordinator integrates
//! concurrent changesets in. The test suite pins this with a permutation
//! harness over peer topologies, plus byte-exact codec round-trips and
//! the concrete merge scenarios from the protocol's rule table.
//!
//! ## Locking contract
//!
//! The engine is single-threaded per group. Integrate, transform, and
//! apply all run while the caller holds the group's write transaction
//! ([`SharedGroup::begin_write`]); the core takes no locks of its own and
//! has no suspension points. Cancellation is cooperative and only honored
//! between changesets.

#![warn(missing_docs)]

mod apply;
mod changeset;
mod clock;
mod codec;
mod error;
mod group;
mod history;
mod id;
mod instruction;
mod integrate;
mod path;
#[cfg(test)]
mod props;
mod transform;
mod value;

pub use crate::apply::{apply_changeset, apply_one};
pub use crate::changeset::{Changeset, InternTable};
pub use crate::clock::{Clock, SystemClock, TestClock};
pub use crate::codec::{decode_changeset, encode_changeset, encode_instruction};
pub use crate::error::{Error, Result};
pub use crate::group::{
    Column, Element, Group, Object, PrimaryKey, ResolvedKey, SharedGroup, Table, Value,
    WriteTransaction,
};
pub use crate::history::{compact, decode_entry, HistoryEntry, SyncHistory};
pub use crate::id::{FileIdent, SaltedVersion, Timestamp, Version};
pub use crate::instruction::{ColumnSpec, Instruction, PrimaryKeySpec, TableType};
pub use crate::integrate::{
    record_local_changeset, CancelToken, Integrator, RemoteChangeset, SyncConfig,
};
pub use crate::path::{classify, Path, PathElem, PathRelation};
pub use crate::transform::{merge_changesets, MergeKey, MergeStats, Reporter, Transformer};
pub use crate::value::{
    CollectionKind, ColumnType, ContainerKind, DateTime, GlobalKey, InternString, ObjectId,
    Payload, SentinelKind, Uuid,
};
