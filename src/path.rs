use crate::changeset::InternTable;
use crate::value::{GlobalKey, InternString};
use smallvec::SmallVec;
use std::fmt;

/// One sub-selector step below a field: dictionary or embedded-object
/// descent by name, or list descent by position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathElem {
    /// Descent into a dictionary value or embedded-object field.
    Field(InternString),
    /// Descent into a list element.
    Index(u32),
}

impl PathElem {
    /// Compares two elements by content across interning tables.
    pub fn eq_in(&self, own: &InternTable, other: &PathElem, other_table: &InternTable) -> bool {
        match (self, other) {
            (PathElem::Field(a), PathElem::Field(b)) => own.get(*a) == other_table.get(*b),
            (PathElem::Index(a), PathElem::Index(b)) => a == b,
            _ => false,
        }
    }
}

/// Address of a position inside the object graph: a table, a global object
/// key, a field, and a sequence of sub-selectors. An empty suffix
/// addresses the field itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Path {
    /// Table name, interned.
    pub table: InternString,
    /// Global key of the addressed object.
    pub object: GlobalKey,
    /// Field name, interned.
    pub field: InternString,
    /// Sub-selectors below the field.
    pub suffix: SmallVec<[PathElem; 2]>,
}

impl Path {
    /// Creates a path addressing `field` on the given object.
    pub fn field(table: InternString, object: GlobalKey, field: InternString) -> Self {
        Self {
            table,
            object,
            field,
            suffix: SmallVec::new(),
        }
    }

    /// Returns the path extended by one sub-selector.
    pub fn child(mut self, elem: PathElem) -> Self {
        self.suffix.push(elem);
        self
    }

    /// The index carried by the final sub-selector, if it is a list
    /// position. For the list-structural instructions this is the
    /// instruction's own index.
    pub fn last_index(&self) -> Option<u32> {
        match self.suffix.last() {
            Some(PathElem::Index(i)) => Some(*i),
            _ => None,
        }
    }

    /// Replaces the index in the final sub-selector.
    pub fn set_last_index(&mut self, index: u32) {
        if let Some(PathElem::Index(i)) = self.suffix.last_mut() {
            *i = index;
        }
    }

    /// The list index this path takes at suffix position `depth`, if any.
    pub fn index_at(&self, depth: usize) -> Option<u32> {
        match self.suffix.get(depth) {
            Some(PathElem::Index(i)) => Some(*i),
            _ => None,
        }
    }

    /// Replaces the list index at suffix position `depth`.
    pub fn set_index_at(&mut self, depth: usize, index: u32) {
        if let Some(PathElem::Index(i)) = self.suffix.get_mut(depth) {
            *i = index;
        }
    }

    /// True if both paths address positions on the same object.
    pub fn same_object(&self, own: &InternTable, other: &Path, other_table: &InternTable) -> bool {
        own.get(self.table) == other_table.get(other.table)
            && self.object.eq_in(own, &other.object, other_table)
    }
}

/// Relationship between two instruction paths, computed by a single
/// left-to-right walk. Exactly one of these holds for any pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathRelation {
    /// The paths differ at the table, object, field, or at a dictionary
    /// key, before either ends: no structural interaction.
    Disjoint,
    /// Identical to the last component.
    Same,
    /// The left path is a strict prefix of the right: the right
    /// instruction operates inside a container the left path addresses.
    LeftPrefixOfRight,
    /// Mirror of [`PathRelation::LeftPrefixOfRight`].
    RightPrefixOfLeft,
    /// The paths agree up to suffix position `depth` and both take a list
    /// index there, with different positions: index shifting applies.
    DivergeAtIndex {
        /// Suffix position of the divergence.
        depth: usize,
        /// Left path's index at the divergence.
        left_index: u32,
        /// Right path's index at the divergence.
        right_index: u32,
    },
}

/// Classifies the relationship between two paths, resolving interned
/// strings through each side's table.
pub fn classify(
    left: &Path,
    left_table: &InternTable,
    right: &Path,
    right_table: &InternTable,
) -> PathRelation {
    if left_table.get(left.table) != right_table.get(right.table)
        || !left.object.eq_in(left_table, &right.object, right_table)
        || left_table.get(left.field) != right_table.get(right.field)
    {
        return PathRelation::Disjoint;
    }
    let shared = left.suffix.len().min(right.suffix.len());
    for depth in 0..shared {
        let l = &left.suffix[depth];
        let r = &right.suffix[depth];
        if l.eq_in(left_table, r, right_table) {
            continue;
        }
        return match (l, r) {
            (PathElem::Index(li), PathElem::Index(ri)) => PathRelation::DivergeAtIndex {
                depth,
                left_index: *li,
                right_index: *ri,
            },
            _ => PathRelation::Disjoint,
        };
    }
    match left.suffix.len().cmp(&right.suffix.len()) {
        std::cmp::Ordering::Equal => PathRelation::Same,
        std::cmp::Ordering::Less => PathRelation::LeftPrefixOfRight,
        std::cmp::Ordering::Greater => PathRelation::RightPrefixOfLeft,
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}[{:?}].{:?}", self.table, self.object, self.field)?;
        for elem in &self.suffix {
            match elem {
                PathElem::Field(s) => write!(f, ".{:?}", s)?,
                PathElem::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}
