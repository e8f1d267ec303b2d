//! Reference in-memory object graph with transactional write access.
//!
//! The engine's collaborators only require a group supporting
//! transactional read/write; this module is the crate's own
//! implementation, used by the applier and by every convergence test.
//! Persistence layout is explicitly out of scope.

use crate::value::{CollectionKind, ColumnType, DateTime, ObjectId, Uuid};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A global key with its string form resolved out of the interning table.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResolvedKey {
    /// Creator-issued pair key of a table without a primary key.
    Pair {
        /// High half, carrying the creator's file identity.
        high: u64,
        /// Low half.
        low: u64,
    },
    /// Integer primary key.
    Int(i64),
    /// String primary key.
    Str(String),
    /// UUID primary key.
    Uuid(Uuid),
}

/// A concrete scalar stored in the group.
#[derive(Clone, Debug)]
pub enum Value {
    /// Null.
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// Byte blob.
    Binary(Vec<u8>),
    /// Timestamp.
    Timestamp(DateTime),
    /// Decimal.
    Decimal(Decimal),
    /// Object id.
    ObjectId(ObjectId),
    /// UUID.
    Uuid(Uuid),
    /// Link to an object; may dangle if the target was erased (readers
    /// mask dangling links to null).
    Link {
        /// Target table name.
        table: String,
        /// Target object key.
        key: ResolvedKey,
    },
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Bool(_) => 2,
            Value::Float(_) => 3,
            Value::Double(_) => 4,
            Value::Str(_) => 5,
            Value::Binary(_) => 6,
            Value::Timestamp(_) => 7,
            Value::Decimal(_) => 8,
            Value::ObjectId(_) => 9,
            Value::Uuid(_) => 10,
            Value::Link { .. } => 11,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (
                Value::Link { table: ta, key: ka },
                Value::Link { table: tb, key: kb },
            ) => ta.cmp(tb).then_with(|| ka.cmp(kb)),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

/// One storage cell: a scalar, a container, or an inline embedded object.
///
/// Embedded objects live inline in their owning slot, which makes the
/// one-parent invariant structural: overwriting the slot destroys the
/// occupant and everything under it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Element {
    /// A scalar value.
    Value(Value),
    /// An ordered list.
    List(Vec<Element>),
    /// A string-keyed dictionary.
    Dict(BTreeMap<String, Element>),
    /// A set of scalars.
    Set(BTreeSet<Value>),
    /// An embedded object: field name to element.
    Object(BTreeMap<String, Element>),
}

impl Element {
    /// The list behind this element, if it is one.
    pub fn as_list(&self) -> Option<&Vec<Element>> {
        match self {
            Element::List(l) => Some(l),
            _ => None,
        }
    }

    /// The scalar behind this element, if it is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Element::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The set behind this element, if it is one.
    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Element::Set(s) => Some(s),
            _ => None,
        }
    }

    /// The dictionary behind this element, if it is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<String, Element>> {
        match self {
            Element::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// The embedded object behind this element, if it is one.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Element>> {
        match self {
            Element::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// Declared column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Column {
    /// Element type.
    pub ty: ColumnType,
    /// Whether null is legal.
    pub nullable: bool,
    /// Collection shape.
    pub collection: CollectionKind,
    /// Link target table.
    pub link_target: Option<String>,
}

/// Declared primary key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrimaryKey {
    /// Key column name.
    pub field: String,
    /// Key column type.
    pub ty: ColumnType,
    /// Whether the key is nullable.
    pub nullable: bool,
}

/// An object's field storage.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Object {
    /// Field name to element. Unset fields read as absent.
    pub fields: BTreeMap<String, Element>,
}

/// A table: schema, live objects, and tombstones of erased ones.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Table {
    /// True for embedded tables, whose objects only exist inline in a
    /// parent slot.
    pub embedded: bool,
    /// Primary key declaration, if any.
    pub pk: Option<PrimaryKey>,
    /// Declared columns.
    pub columns: BTreeMap<String, Column>,
    /// Live objects by key.
    pub objects: BTreeMap<ResolvedKey, Object>,
    /// Keys of erased objects. Links resolving here are dangling rather
    /// than corrupt.
    pub tombstones: BTreeSet<ResolvedKey>,
}

/// The object graph.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Group {
    /// Tables by name.
    pub tables: BTreeMap<String, Table>,
}

impl Group {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with the given name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Mutable access to the table with the given name.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Reads a field of an object. Returns `None` for missing tables,
    /// objects, or unset fields.
    pub fn field(&self, table: &str, key: &ResolvedKey, field: &str) -> Option<&Element> {
        self.tables.get(table)?.objects.get(key)?.fields.get(field)
    }
}

/// Shared handle to a group guarded by a reader-writer lock.
///
/// The engine is single-threaded per group: integrate, apply, and
/// transform all run while the caller holds the write transaction. This
/// type is that contract in code; the core takes no other locks.
#[derive(Clone, Debug, Default)]
pub struct SharedGroup {
    inner: Arc<RwLock<Group>>,
}

impl SharedGroup {
    /// Wraps a group.
    pub fn new(group: Group) -> Self {
        Self {
            inner: Arc::new(RwLock::new(group)),
        }
    }

    /// Takes a read snapshot.
    pub fn read(&self) -> RwLockReadGuard<'_, Group> {
        self.inner.read()
    }

    /// Begins a write transaction. Dropping the transaction without
    /// committing rolls every change back.
    pub fn begin_write(&self) -> WriteTransaction<'_> {
        let guard = self.inner.write();
        let rollback = guard.clone();
        WriteTransaction {
            guard,
            rollback: Some(rollback),
        }
    }
}

/// Exclusive write access with rollback-on-drop semantics.
pub struct WriteTransaction<'a> {
    guard: RwLockWriteGuard<'a, Group>,
    rollback: Option<Group>,
}

impl WriteTransaction<'_> {
    /// Makes the transaction's changes permanent.
    pub fn commit(mut self) {
        self.rollback = None;
    }

    /// Discards the transaction's changes.
    pub fn rollback(self) {}
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if let Some(rollback) = self.rollback.take() {
            *self.guard = rollback;
        }
    }
}

impl Deref for WriteTransaction<'_> {
    type Target = Group;

    fn deref(&self) -> &Group {
        &self.guard
    }
}

impl DerefMut for WriteTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Group {
        &mut self.guard
    }
}
