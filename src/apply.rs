//! Executes a (possibly transformed) changeset against a group.
//!
//! The applier walks the instructions once, holds no state beyond the
//! current transaction, and is pure with respect to ordering: any prefix
//! followed by the suffix yields the same group as the whole walk.
//! `prior_size` verification is a safety net against transformer bugs and
//! corrupt wire data; it must never trip for a well-formed merge.

use crate::changeset::Changeset;
use crate::error::{Error, Result};
use crate::group::{Column, Element, Group, PrimaryKey, ResolvedKey, Table, Value};
use crate::instruction::{ColumnSpec, Instruction, TableType};
use crate::path::{Path, PathElem};
use crate::value::{CollectionKind, ColumnType, ContainerKind, GlobalKey, Payload};

/// Applies every live instruction of `changeset` to `group`, in order.
pub fn apply_changeset(group: &mut Group, changeset: &Changeset) -> Result<()> {
    for (slot, instruction) in changeset.iter() {
        let applier = Applier { changeset, slot };
        applier.apply(group, instruction)?;
    }
    Ok(())
}

/// Applies a single instruction, using `changeset` only to resolve its
/// interned strings. Local writes run through here as the user issues
/// them, before the instruction is recorded.
pub fn apply_one(group: &mut Group, changeset: &Changeset, instruction: &Instruction) -> Result<()> {
    Applier { changeset, slot: 0 }.apply(group, instruction)
}

struct Applier<'a> {
    changeset: &'a Changeset,
    slot: usize,
}

impl<'a> Applier<'a> {
    fn bad_schema(&self) -> Error {
        Error::bad_schema(self.slot)
    }

    fn bad_changeset(&self) -> Error {
        Error::bad_changeset(self.slot)
    }

    fn s(&self, s: crate::value::InternString) -> &'a str {
        self.changeset.lookup(s)
    }

    fn resolve_key(&self, key: &GlobalKey) -> ResolvedKey {
        match key {
            GlobalKey::Pair { high, low } => ResolvedKey::Pair {
                high: *high,
                low: *low,
            },
            GlobalKey::Int(v) => ResolvedKey::Int(*v),
            GlobalKey::Str(s) => ResolvedKey::Str(self.s(*s).to_string()),
            GlobalKey::Uuid(u) => ResolvedKey::Uuid(*u),
        }
    }

    fn apply(&self, group: &mut Group, instruction: &Instruction) -> Result<()> {
        tracing::trace!(slot = self.slot, ?instruction, "apply");
        match instruction {
            Instruction::AddTable { table, ty } => self.add_table(group, *table, ty),
            Instruction::EraseTable { table } => {
                group.tables.remove(self.s(*table));
                Ok(())
            }
            Instruction::AddColumn { table, field, spec } => {
                self.add_column(group, *table, *field, spec)
            }
            Instruction::EraseColumn { table, field } => {
                let table = match group.table_mut(self.s(*table)) {
                    Some(t) => t,
                    None => return Ok(()),
                };
                let field = self.s(*field);
                table.columns.remove(field);
                for object in table.objects.values_mut() {
                    object.fields.remove(field);
                }
                Ok(())
            }
            Instruction::CreateObject { table, object } => self.create_object(group, *table, object),
            Instruction::EraseObject { table, object } => {
                let key = self.resolve_key(object);
                let table = group
                    .table_mut(self.s(*table))
                    .ok_or_else(|| self.bad_schema())?;
                table.objects.remove(&key);
                table.tombstones.insert(key);
                Ok(())
            }
            Instruction::Update {
                path,
                value,
                is_default: _,
                prior_add,
            } => self.update(group, path, value, *prior_add),
            Instruction::AddInteger { path, delta } => self.add_integer(group, path, *delta),
            Instruction::ArrayInsert {
                path,
                value,
                prior_size,
            } => self.array_insert(group, path, value, *prior_size),
            Instruction::ArrayMove { path, to } => self.array_move(group, path, *to),
            Instruction::ArrayErase { path, prior_size } => {
                self.array_erase(group, path, *prior_size)
            }
            Instruction::Clear { path, collection } => self.clear(group, path, *collection),
            Instruction::SetInsert { path, value } => self.set_op(group, path, value, true),
            Instruction::SetErase { path, value } => self.set_op(group, path, value, false),
        }
    }

    fn add_table(&self, group: &mut Group, table: crate::value::InternString, ty: &TableType) -> Result<()> {
        let name = self.s(table);
        let (embedded, pk) = match ty {
            TableType::Embedded => (true, None),
            TableType::TopLevel { pk } => (
                false,
                pk.as_ref().map(|pk| PrimaryKey {
                    field: self.s(pk.field).to_string(),
                    ty: pk.ty,
                    nullable: pk.nullable,
                }),
            ),
        };
        match group.table(name) {
            Some(existing) => {
                if existing.embedded != embedded || existing.pk != pk {
                    return Err(self.bad_schema());
                }
            }
            None => {
                group.tables.insert(
                    name.to_string(),
                    Table {
                        embedded,
                        pk,
                        ..Table::default()
                    },
                );
            }
        }
        Ok(())
    }

    fn add_column(
        &self,
        group: &mut Group,
        table: crate::value::InternString,
        field: crate::value::InternString,
        spec: &ColumnSpec,
    ) -> Result<()> {
        let column = Column {
            ty: spec.ty,
            nullable: spec.nullable,
            collection: spec.collection,
            link_target: spec.link_target.map(|t| self.s(t).to_string()),
        };
        let table = group
            .table_mut(self.s(table))
            .ok_or_else(|| self.bad_schema())?;
        match table.columns.get(self.s(field)) {
            Some(existing) => {
                if *existing != column {
                    return Err(self.bad_schema());
                }
            }
            None => {
                table.columns.insert(self.s(field).to_string(), column);
            }
        }
        Ok(())
    }

    fn create_object(
        &self,
        group: &mut Group,
        table: crate::value::InternString,
        object: &GlobalKey,
    ) -> Result<()> {
        let key = self.resolve_key(object);
        let pk_value = match &key {
            ResolvedKey::Pair { .. } => None,
            ResolvedKey::Int(v) => Some(Value::Int(*v)),
            ResolvedKey::Str(s) => Some(Value::Str(s.clone())),
            ResolvedKey::Uuid(u) => Some(Value::Uuid(*u)),
        };
        let table = group
            .table_mut(self.s(table))
            .ok_or_else(|| self.bad_schema())?;
        if table.embedded {
            // Embedded objects only come to life through a parent slot.
            return Err(self.bad_changeset());
        }
        match (&table.pk, &pk_value) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => return Err(self.bad_changeset()),
        }
        table.tombstones.remove(&key);
        let pk_field = table.pk.as_ref().map(|pk| pk.field.clone());
        let object = table.objects.entry(key).or_default();
        if let (Some(field), Some(value)) = (pk_field, pk_value) {
            object
                .fields
                .entry(field)
                .or_insert(Element::Value(value));
        }
        Ok(())
    }

    /// Converts a payload into a storable element, validating links
    /// against the receiving group. Links may resolve to tombstones of
    /// erased objects (dangling, masked by readers) but never to keys
    /// that were never issued.
    fn element_for_payload(&self, group: &Group, value: &Payload) -> Result<Element> {
        Ok(match value {
            Payload::Null => Element::Value(Value::Null),
            Payload::Int(v) => Element::Value(Value::Int(*v)),
            Payload::Bool(b) => Element::Value(Value::Bool(*b)),
            Payload::Float(f) => Element::Value(Value::Float(*f)),
            Payload::Double(f) => Element::Value(Value::Double(*f)),
            Payload::Str(s) => Element::Value(Value::Str(self.s(*s).to_string())),
            Payload::Binary(b) => Element::Value(Value::Binary(b.clone())),
            Payload::Timestamp(t) => Element::Value(Value::Timestamp(*t)),
            Payload::Decimal(d) => Element::Value(Value::Decimal(*d)),
            Payload::ObjectId(o) => Element::Value(Value::ObjectId(*o)),
            Payload::Uuid(u) => Element::Value(Value::Uuid(*u)),
            Payload::Link {
                target_table,
                target,
            } => {
                let table_name = self.s(*target_table);
                let key = self.resolve_key(target);
                let table = group.table(table_name).ok_or_else(|| self.bad_schema())?;
                if !table.objects.contains_key(&key) && !table.tombstones.contains(&key) {
                    return Err(self.bad_changeset());
                }
                Element::Value(Value::Link {
                    table: table_name.to_string(),
                    key,
                })
            }
            Payload::List => Element::List(Vec::new()),
            Payload::Dictionary => Element::Dict(Default::default()),
            Payload::EmbeddedObject => Element::Object(Default::default()),
            Payload::Erased => return Err(self.bad_changeset()),
        })
    }

    fn value_for_payload(&self, group: &Group, value: &Payload) -> Result<Value> {
        match self.element_for_payload(group, value)? {
            Element::Value(v) => Ok(v),
            _ => Err(self.bad_changeset()),
        }
    }

    fn payload_matches(&self, column: &Column, value: &Payload) -> bool {
        match value {
            Payload::Null => {
                column.nullable || matches!(column.ty, ColumnType::Link | ColumnType::Mixed)
            }
            Payload::Erased => true,
            Payload::Int(_) => matches!(column.ty, ColumnType::Int | ColumnType::Mixed),
            Payload::Bool(_) => matches!(column.ty, ColumnType::Bool | ColumnType::Mixed),
            Payload::Float(_) => matches!(column.ty, ColumnType::Float | ColumnType::Mixed),
            Payload::Double(_) => matches!(column.ty, ColumnType::Double | ColumnType::Mixed),
            Payload::Str(_) => matches!(column.ty, ColumnType::String | ColumnType::Mixed),
            Payload::Binary(_) => matches!(column.ty, ColumnType::Binary | ColumnType::Mixed),
            Payload::Timestamp(_) => {
                matches!(column.ty, ColumnType::Timestamp | ColumnType::Mixed)
            }
            Payload::Decimal(_) => matches!(column.ty, ColumnType::Decimal | ColumnType::Mixed),
            Payload::ObjectId(_) => {
                matches!(column.ty, ColumnType::ObjectId | ColumnType::Mixed)
            }
            Payload::Uuid(_) => matches!(column.ty, ColumnType::Uuid | ColumnType::Mixed),
            Payload::Link { .. } | Payload::EmbeddedObject => {
                matches!(column.ty, ColumnType::Link | ColumnType::Mixed)
            }
            Payload::List | Payload::Dictionary => matches!(column.ty, ColumnType::Mixed),
        }
    }

    fn column_for_path(&self, group: &Group, path: &Path) -> Result<Column> {
        let table = group
            .table(self.s(path.table))
            .ok_or_else(|| self.bad_schema())?;
        table
            .columns
            .get(self.s(path.field))
            .cloned()
            .ok_or_else(|| self.bad_schema())
    }

    /// The root element for a path: the object's field slot, materialized
    /// as an empty container for declared collection columns.
    fn root_slot<'g>(
        &self,
        group: &'g mut Group,
        path: &Path,
        column: &Column,
    ) -> Result<&'g mut Element> {
        let key = self.resolve_key(&path.object);
        let table = group
            .table_mut(self.s(path.table))
            .ok_or_else(|| self.bad_schema())?;
        let object = table
            .objects
            .get_mut(&key)
            .ok_or_else(|| self.bad_changeset())?;
        let field = self.s(path.field);
        if !object.fields.contains_key(field) {
            let materialized = match column.collection {
                CollectionKind::List => Element::List(Vec::new()),
                CollectionKind::Dictionary => Element::Dict(Default::default()),
                CollectionKind::Set => Element::Set(Default::default()),
                CollectionKind::Single => return Err(self.bad_changeset()),
            };
            object.fields.insert(field.to_string(), materialized);
        }
        Ok(object.fields.get_mut(field).unwrap())
    }

    /// Walks `elems` down from `root`, failing on missing or mistyped
    /// steps.
    fn walk<'g>(&self, mut current: &'g mut Element, elems: &[PathElem]) -> Result<&'g mut Element> {
        for elem in elems {
            current = match (elem, current) {
                (PathElem::Field(name), Element::Dict(dict)) => dict
                    .get_mut(self.s(*name))
                    .ok_or_else(|| self.bad_changeset())?,
                (PathElem::Field(name), Element::Object(fields)) => fields
                    .get_mut(self.s(*name))
                    .ok_or_else(|| self.bad_changeset())?,
                (PathElem::Index(i), Element::List(list)) => list
                    .get_mut(*i as usize)
                    .ok_or_else(|| self.bad_changeset())?,
                _ => return Err(self.bad_changeset()),
            };
        }
        Ok(current)
    }

    /// Walks to the container addressed by `elems`, materializing the
    /// final step as an empty container of `kind` when it names an unset
    /// dictionary value or embedded-object field. Collection fields of
    /// embedded objects come to life on first use, like collection
    /// columns do.
    fn walk_to_container<'g>(
        &self,
        root: &'g mut Element,
        elems: &[PathElem],
        kind: ContainerKind,
    ) -> Result<&'g mut Element> {
        let (last, front) = match elems.split_last() {
            Some(split) => split,
            None => return Ok(root),
        };
        let parent = self.walk(root, front)?;
        let empty = || match kind {
            ContainerKind::List => Element::List(Vec::new()),
            ContainerKind::Dictionary => Element::Dict(Default::default()),
            ContainerKind::Set => Element::Set(Default::default()),
        };
        match (last, parent) {
            (PathElem::Field(name), Element::Dict(dict)) => {
                Ok(dict.entry(self.s(*name).to_string()).or_insert_with(empty))
            }
            (PathElem::Field(name), Element::Object(fields)) => {
                Ok(fields.entry(self.s(*name).to_string()).or_insert_with(empty))
            }
            (PathElem::Index(i), Element::List(list)) => list
                .get_mut(*i as usize)
                .ok_or_else(|| self.bad_changeset()),
            _ => Err(self.bad_changeset()),
        }
    }

    /// Writes into a named slot of a map (object fields, dictionary
    /// values, embedded-object fields), creating it when unset.
    fn write_map_slot(
        map: &mut std::collections::BTreeMap<String, Element>,
        name: &str,
        new: Element,
        prior_add: Option<i64>,
    ) {
        use std::collections::btree_map::Entry;
        match map.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                Self::assign(entry.get_mut(), new);
                Self::apply_prior_add(entry.get_mut(), prior_add);
            }
            Entry::Vacant(entry) => {
                let mut slot = new;
                Self::apply_prior_add(&mut slot, prior_add);
                entry.insert(slot);
            }
        }
    }

    /// Writes `new` into a slot, preserving an existing container when the
    /// incoming element is a same-kind sentinel (idempotent conversion).
    fn assign(slot: &mut Element, new: Element) {
        let idempotent = matches!(
            (&*slot, &new),
            (Element::List(_), Element::List(_))
                | (Element::Dict(_), Element::Dict(_))
                | (Element::Object(_), Element::Object(_))
        );
        if !idempotent {
            *slot = new;
        }
    }

    fn apply_prior_add(slot: &mut Element, prior_add: Option<i64>) {
        if let (Element::Value(Value::Int(v)), Some(delta)) = (slot, prior_add) {
            *v = v.wrapping_add(delta);
        }
    }

    fn update(
        &self,
        group: &mut Group,
        path: &Path,
        value: &Payload,
        prior_add: Option<i64>,
    ) -> Result<()> {
        let column = self.column_for_path(group, path)?;
        let new = if matches!(value, Payload::Erased) {
            None
        } else {
            Some(self.element_for_payload(group, value)?)
        };
        if path.suffix.is_empty() {
            // Nested slots (dictionary values, embedded-object fields,
            // list elements) are dynamically typed; only the column slot
            // itself is checked against the declared type.
            if !self.payload_matches(&column, value) {
                return Err(self.bad_changeset());
            }
            if column.collection != CollectionKind::Single {
                return Err(self.bad_changeset());
            }
            let key = self.resolve_key(&path.object);
            let table = group
                .table_mut(self.s(path.table))
                .ok_or_else(|| self.bad_schema())?;
            let object = table
                .objects
                .get_mut(&key)
                .ok_or_else(|| self.bad_changeset())?;
            let new = new.ok_or_else(|| self.bad_changeset())?;
            let field = self.s(path.field);
            Self::write_map_slot(&mut object.fields, field, new, prior_add);
            return Ok(());
        }
        let root = self.root_slot(group, path, &column)?;
        let (last, front) = path.suffix.split_last().unwrap();
        let parent = self.walk(root, front)?;
        match (last, parent) {
            (PathElem::Field(name), Element::Dict(dict)) => {
                let name = self.s(*name);
                match new {
                    None => {
                        dict.remove(name);
                    }
                    Some(new) => Self::write_map_slot(dict, name, new, prior_add),
                }
                Ok(())
            }
            (PathElem::Field(name), Element::Object(fields)) => {
                let name = self.s(*name);
                let new = new.ok_or_else(|| self.bad_changeset())?;
                Self::write_map_slot(fields, name, new, prior_add);
                Ok(())
            }
            (PathElem::Index(i), Element::List(list)) => {
                let new = new.ok_or_else(|| self.bad_changeset())?;
                let slot = list
                    .get_mut(*i as usize)
                    .ok_or_else(|| self.bad_changeset())?;
                Self::assign(slot, new);
                Self::apply_prior_add(slot, prior_add);
                Ok(())
            }
            _ => Err(self.bad_changeset()),
        }
    }

    fn add_integer(&self, group: &mut Group, path: &Path, delta: i64) -> Result<()> {
        let column = self.column_for_path(group, path)?;
        if path.suffix.is_empty() {
            let key = self.resolve_key(&path.object);
            let table = group
                .table_mut(self.s(path.table))
                .ok_or_else(|| self.bad_schema())?;
            let object = table
                .objects
                .get_mut(&key)
                .ok_or_else(|| self.bad_changeset())?;
            let field = self.s(path.field);
            use std::collections::btree_map::Entry;
            match object.fields.entry(field.to_string()) {
                Entry::Occupied(mut entry) => {
                    if let Element::Value(Value::Int(v)) = entry.get_mut() {
                        *v = v.wrapping_add(delta);
                    }
                    // Anything else is a pending addition with no integer
                    // to land on.
                }
                Entry::Vacant(entry) => {
                    if column.ty == ColumnType::Int && column.collection == CollectionKind::Single {
                        // Unset integer fields read as zero.
                        entry.insert(Element::Value(Value::Int(delta)));
                    }
                }
            }
            return Ok(());
        }
        let root = match self.root_slot(group, path, &column) {
            Ok(root) => root,
            // The container the addition targeted is gone; the addition
            // stays pending forever.
            Err(Error::BadChangeset { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.walk(root, &path.suffix) {
            Ok(Element::Value(Value::Int(v))) => *v = v.wrapping_add(delta),
            Ok(_) => {}
            Err(Error::BadChangeset { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn list_at<'g>(
        &self,
        group: &'g mut Group,
        path: &Path,
    ) -> Result<&'g mut Vec<Element>> {
        let column = self.column_for_path(group, path)?;
        let root = self.root_slot(group, path, &column)?;
        let (_, front) = path.suffix.split_last().unwrap();
        match self.walk_to_container(root, front, ContainerKind::List)? {
            Element::List(list) => Ok(list),
            _ => Err(self.bad_changeset()),
        }
    }

    fn array_insert(
        &self,
        group: &mut Group,
        path: &Path,
        value: &Payload,
        prior_size: u32,
    ) -> Result<()> {
        let index = path.last_index().ok_or_else(|| self.bad_changeset())? as usize;
        let element = self.element_for_payload(group, value)?;
        let list = self.list_at(group, path)?;
        if list.len() != prior_size as usize {
            tracing::debug!(
                prior_size,
                len = list.len(),
                "prior_size mismatch on insert"
            );
            return Err(self.bad_changeset());
        }
        if index > list.len() {
            return Err(self.bad_changeset());
        }
        list.insert(index, element);
        Ok(())
    }

    fn array_erase(&self, group: &mut Group, path: &Path, prior_size: u32) -> Result<()> {
        let index = path.last_index().ok_or_else(|| self.bad_changeset())? as usize;
        let list = self.list_at(group, path)?;
        if list.len() != prior_size as usize {
            tracing::debug!(prior_size, len = list.len(), "prior_size mismatch on erase");
            return Err(self.bad_changeset());
        }
        if index >= list.len() {
            return Err(self.bad_changeset());
        }
        list.remove(index);
        Ok(())
    }

    fn array_move(&self, group: &mut Group, path: &Path, to: u32) -> Result<()> {
        let from = path.last_index().ok_or_else(|| self.bad_changeset())? as usize;
        let to = to as usize;
        let list = self.list_at(group, path)?;
        if from >= list.len() || to >= list.len() {
            return Err(self.bad_changeset());
        }
        let element = list.remove(from);
        list.insert(to, element);
        Ok(())
    }

    fn clear(&self, group: &mut Group, path: &Path, collection: ContainerKind) -> Result<()> {
        let column = self.column_for_path(group, path)?;
        if path.suffix.is_empty() {
            let key = self.resolve_key(&path.object);
            let table = group
                .table_mut(self.s(path.table))
                .ok_or_else(|| self.bad_schema())?;
            let object = table
                .objects
                .get_mut(&key)
                .ok_or_else(|| self.bad_changeset())?;
            let field = self.s(path.field);
            let slot = object.fields.entry(field.to_string()).or_insert_with(|| {
                match collection {
                    ContainerKind::List => Element::List(Vec::new()),
                    ContainerKind::Dictionary => Element::Dict(Default::default()),
                    ContainerKind::Set => Element::Set(Default::default()),
                }
            });
            return match slot {
                Element::List(list) => {
                    list.clear();
                    Ok(())
                }
                Element::Dict(dict) => {
                    dict.clear();
                    Ok(())
                }
                Element::Set(set) => {
                    set.clear();
                    Ok(())
                }
                _ => Err(self.bad_changeset()),
            };
        }
        let root = self.root_slot(group, path, &column)?;
        match self.walk_to_container(root, &path.suffix, collection)? {
            Element::List(list) => list.clear(),
            Element::Dict(dict) => dict.clear(),
            Element::Set(set) => set.clear(),
            _ => return Err(self.bad_changeset()),
        }
        Ok(())
    }

    fn set_op(&self, group: &mut Group, path: &Path, value: &Payload, insert: bool) -> Result<()> {
        let value = self.value_for_payload(group, value)?;
        let column = self.column_for_path(group, path)?;
        let set = if path.suffix.is_empty() {
            if column.collection != CollectionKind::Set {
                return Err(self.bad_changeset());
            }
            match self.root_slot(group, path, &column)? {
                Element::Set(set) => set,
                _ => return Err(self.bad_changeset()),
            }
        } else {
            let root = self.root_slot(group, path, &column)?;
            match self.walk_to_container(root, &path.suffix, ContainerKind::Set)? {
                Element::Set(set) => set,
                _ => return Err(self.bad_changeset()),
            }
        };
        if insert {
            set.insert(value);
        } else {
            set.remove(&value);
        }
        Ok(())
    }
}
