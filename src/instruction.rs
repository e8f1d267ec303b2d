use crate::changeset::InternTable;
use crate::path::Path;
use crate::value::{
    CollectionKind, ColumnType, ContainerKind, GlobalKey, InternString, Payload,
};

/// Primary-key declaration carried by `AddTable` for keyed tables.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrimaryKeySpec {
    /// Name of the key column, interned.
    pub field: InternString,
    /// Declared type of the key column.
    pub ty: ColumnType,
    /// Whether the key column is nullable.
    pub nullable: bool,
}

/// Shape of a table declared by `AddTable`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TableType {
    /// An ordinary table, optionally with a primary key. Objects of
    /// tables without one are keyed by creator-issued `(high, low)` pairs.
    TopLevel {
        /// Primary key declaration, if any.
        pk: Option<PrimaryKeySpec>,
    },
    /// An embedded table. Its objects are created only through a parent
    /// slot and live inside exactly one parent at a time.
    Embedded,
}

impl TableType {
    /// Compares two declarations by content across interning tables.
    pub fn eq_in(&self, own: &InternTable, other: &TableType, other_table: &InternTable) -> bool {
        match (self, other) {
            (TableType::Embedded, TableType::Embedded) => true,
            (TableType::TopLevel { pk: None }, TableType::TopLevel { pk: None }) => true,
            (TableType::TopLevel { pk: Some(a) }, TableType::TopLevel { pk: Some(b) }) => {
                own.get(a.field) == other_table.get(b.field)
                    && a.ty == b.ty
                    && a.nullable == b.nullable
            }
            _ => false,
        }
    }
}

/// Column declaration carried by `AddColumn`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnSpec {
    /// Declared element type.
    pub ty: ColumnType,
    /// Whether null is a legal value.
    pub nullable: bool,
    /// Collection shape.
    pub collection: CollectionKind,
    /// Target table for link columns, interned.
    pub link_target: Option<InternString>,
}

impl ColumnSpec {
    /// Compares two specs by content across interning tables.
    pub fn eq_in(&self, own: &InternTable, other: &ColumnSpec, other_table: &InternTable) -> bool {
        self.ty == other.ty
            && self.nullable == other.nullable
            && self.collection == other.collection
            && match (self.link_target, other.link_target) {
                (None, None) => true,
                (Some(a), Some(b)) => own.get(a) == other_table.get(b),
                _ => false,
            }
    }
}

/// One fine-grained mutation of the object graph.
///
/// The transformer and the applier match exhaustively on this type; a new
/// variant fails the build in both, which is how the merge rule table stays
/// total.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Declares a table.
    AddTable {
        /// Table name, interned.
        table: InternString,
        /// Table shape.
        ty: TableType,
    },
    /// Removes a table and everything in it.
    EraseTable {
        /// Table name, interned.
        table: InternString,
    },
    /// Declares a column.
    AddColumn {
        /// Table name, interned.
        table: InternString,
        /// Column name, interned.
        field: InternString,
        /// Column declaration.
        spec: ColumnSpec,
    },
    /// Removes a column and its data.
    EraseColumn {
        /// Table name, interned.
        table: InternString,
        /// Column name, interned.
        field: InternString,
    },
    /// Creates an object. Get-or-create for primary-key tables.
    CreateObject {
        /// Table name, interned.
        table: InternString,
        /// Global key of the new object.
        object: GlobalKey,
    },
    /// Erases an object, leaving a tombstone for dangling links.
    EraseObject {
        /// Table name, interned.
        table: InternString,
        /// Global key of the erased object.
        object: GlobalKey,
    },
    /// Writes a value to the slot addressed by `path`: a field, a list
    /// element, a dictionary key, or an embedded-object field.
    Update {
        /// Addressed slot.
        path: Path,
        /// Value to write. `Erased` removes a dictionary key; sentinel
        /// payloads convert the slot into a container or embedded object.
        value: Payload,
        /// Default writes rank at minus-infinity in the merge and never
        /// overwrite a concrete concurrent write.
        is_default: bool,
        /// Integer delta that rides with the write: the collapsed
        /// `AddInteger` accumulator, reapplied on top of whatever value
        /// the slot ends up with.
        prior_add: Option<i64>,
    },
    /// Adds a delta to the integer at `path`. A no-op at apply time when
    /// the slot holds null or a non-integer.
    AddInteger {
        /// Addressed slot.
        path: Path,
        /// Delta to add.
        delta: i64,
    },
    /// Inserts `value` at the list position named by the path's final
    /// index.
    ArrayInsert {
        /// Addressed position; final sub-selector is the index.
        path: Path,
        /// Element to insert.
        value: Payload,
        /// List size immediately before this instruction executed at its
        /// origin; recomputed by the transformer for every surviving
        /// instance and checked by the applier.
        prior_size: u32,
    },
    /// Moves the element at the path's final index to `to`, where `to` is
    /// a position in the list after removal.
    ArrayMove {
        /// Addressed source position.
        path: Path,
        /// Destination position, post-removal coordinates.
        to: u32,
    },
    /// Removes the element at the path's final index.
    ArrayErase {
        /// Addressed position.
        path: Path,
        /// List size immediately before execution at the origin.
        prior_size: u32,
    },
    /// Empties the container at `path`.
    Clear {
        /// Addressed container.
        path: Path,
        /// Kind of the container being cleared.
        collection: ContainerKind,
    },
    /// Inserts `value` into the set at `path`.
    SetInsert {
        /// Addressed set.
        path: Path,
        /// Element value.
        value: Payload,
    },
    /// Removes `value` from the set at `path`.
    SetErase {
        /// Addressed set.
        path: Path,
        /// Element value.
        value: Payload,
    },
}

impl Instruction {
    /// The path this instruction addresses, for the path-carrying
    /// variants.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Instruction::Update { path, .. }
            | Instruction::AddInteger { path, .. }
            | Instruction::ArrayInsert { path, .. }
            | Instruction::ArrayMove { path, .. }
            | Instruction::ArrayErase { path, .. }
            | Instruction::Clear { path, .. }
            | Instruction::SetInsert { path, .. }
            | Instruction::SetErase { path, .. } => Some(path),
            Instruction::AddTable { .. }
            | Instruction::EraseTable { .. }
            | Instruction::AddColumn { .. }
            | Instruction::EraseColumn { .. }
            | Instruction::CreateObject { .. }
            | Instruction::EraseObject { .. } => None,
        }
    }

    /// Mutable access to the addressed path.
    pub fn path_mut(&mut self) -> Option<&mut Path> {
        match self {
            Instruction::Update { path, .. }
            | Instruction::AddInteger { path, .. }
            | Instruction::ArrayInsert { path, .. }
            | Instruction::ArrayMove { path, .. }
            | Instruction::ArrayErase { path, .. }
            | Instruction::Clear { path, .. }
            | Instruction::SetInsert { path, .. }
            | Instruction::SetErase { path, .. } => Some(path),
            Instruction::AddTable { .. }
            | Instruction::EraseTable { .. }
            | Instruction::AddColumn { .. }
            | Instruction::EraseColumn { .. }
            | Instruction::CreateObject { .. }
            | Instruction::EraseObject { .. } => None,
        }
    }

    /// The table this instruction touches.
    pub fn table(&self) -> InternString {
        match self {
            Instruction::AddTable { table, .. }
            | Instruction::EraseTable { table }
            | Instruction::AddColumn { table, .. }
            | Instruction::EraseColumn { table, .. }
            | Instruction::CreateObject { table, .. }
            | Instruction::EraseObject { table, .. } => *table,
            other => other.path().unwrap().table,
        }
    }

    /// The object this instruction touches, if it addresses one.
    pub fn object(&self) -> Option<&GlobalKey> {
        match self {
            Instruction::CreateObject { object, .. }
            | Instruction::EraseObject { object, .. } => Some(object),
            other => other.path().map(|p| &p.object),
        }
    }

    /// True for the list-structural variants whose final path element is
    /// their own list index.
    pub fn is_list_structural(&self) -> bool {
        matches!(
            self,
            Instruction::ArrayInsert { .. }
                | Instruction::ArrayMove { .. }
                | Instruction::ArrayErase { .. }
        )
    }
}
