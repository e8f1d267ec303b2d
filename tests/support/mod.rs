//! Short-circuit peer harness: a star of peers wired directly to a
//! coordinator, no transport. Local transactions build and immediately
//! apply instructions; `integrate_next_from` pulls one producible entry
//! from another peer's history through the full transform-apply-record
//! path.

#![allow(dead_code)]

use anyhow::{ensure, Result};
use otsync::{
    apply_one, record_local_changeset, Changeset, CollectionKind, ColumnSpec, ColumnType,
    ContainerKind, Element, FileIdent, GlobalKey, Group, Instruction, Integrator, Path, PathElem,
    Payload, PrimaryKeySpec, RemoteChangeset, ResolvedKey, SharedGroup, SyncConfig, SyncHistory,
    TableType, TestClock, Value, Version,
};
use std::collections::HashMap;

/// One synchronized participant.
pub struct Peer {
    pub file: FileIdent,
    pub group: SharedGroup,
    pub history: SyncHistory,
    pub clock: TestClock,
    pub config: SyncConfig,
    last_integrated: HashMap<FileIdent, Version>,
    next_key: u64,
}

impl Peer {
    pub fn server() -> Peer {
        Peer::with_ident(FileIdent::COORDINATOR)
    }

    pub fn client(ident: u64) -> Peer {
        assert!(ident >= 2, "client identities start at 2");
        Peer::with_ident(FileIdent::new(ident))
    }

    fn with_ident(file: FileIdent) -> Peer {
        init_tracing();
        Peer {
            file,
            group: SharedGroup::new(Group::new()),
            history: SyncHistory::new(file),
            clock: TestClock::new(),
            config: SyncConfig::default(),
            last_integrated: HashMap::new(),
            next_key: 1,
        }
    }

    pub fn advance_time(&self, amount: u64) {
        self.clock.advance(amount);
    }

    pub fn disable_compaction(&mut self) {
        self.config.disable_compaction = true;
    }

    /// Runs a local write transaction, recording and applying every
    /// instruction the closure emits.
    pub fn transaction<F: FnOnce(&mut Tx)>(&mut self, f: F) -> Version {
        let mut guard = self.group.begin_write();
        let mut changeset = Changeset::new();
        {
            let mut tx = Tx {
                group: &mut *guard,
                changeset: &mut changeset,
                file: self.file,
                next_key: &mut self.next_key,
            };
            f(&mut tx);
        }
        guard.commit();
        record_local_changeset(&mut self.history, &mut changeset, &self.clock)
    }

    /// Number of entries `remote` has that this peer has not pulled yet.
    pub fn count_outstanding_from(&self, remote: &Peer) -> usize {
        let mut n = 0;
        let mut version = self.baseline_for(remote);
        loop {
            let next = remote.history.find_next(
                version,
                remote.history.current_version(),
                self.file,
                false,
            );
            if next == 0 {
                return n;
            }
            n += 1;
            version = next;
        }
    }

    fn baseline_for(&self, remote: &Peer) -> Version {
        *self.last_integrated.get(&remote.file).unwrap_or(&1)
    }

    /// Pulls and integrates the next producible changeset from `remote`.
    /// Returns false when there was nothing to pull.
    pub fn integrate_next_from(&mut self, remote: &Peer) -> Result<bool> {
        let begin = self.baseline_for(remote);
        let version = remote
            .history
            .find_next(begin, remote.history.current_version(), self.file, false);
        if version == 0 {
            return Ok(false);
        }
        let entry = remote.history.entry_at(version).unwrap();
        let incoming = RemoteChangeset {
            data: remote.history.reciprocal(self.file, version).to_vec(),
            remote_version: version,
            // The reciprocal already reflects everything the sender has
            // integrated from this peer, so the baseline is the sender's
            // current acknowledgement, not the entry-time one.
            last_integrated_local_version: remote
                .history
                .last_integrated_remote_version(self.file, remote.history.current_version()),
            origin_file: if entry.origin_file.is_local() {
                remote.file
            } else {
                entry.origin_file
            },
            origin_timestamp: entry.origin_timestamp,
        };
        let mut guard = self.group.begin_write();
        let mut integrator = Integrator::new(&mut self.history, self.config.clone());
        integrator.integrate_remote_changesets(&mut *guard, &[incoming], None)?;
        guard.commit();
        self.last_integrated.insert(remote.file, version);
        Ok(true)
    }

    pub fn integrate_all_from(&mut self, remote: &Peer) -> Result<usize> {
        let mut n = 0;
        while self.integrate_next_from(remote)? {
            n += 1;
        }
        Ok(n)
    }

    // ---- read helpers ----

    pub fn element(&self, table: &str, key: &GlobalKey, field: &str) -> Option<Element> {
        let group = self.group.read();
        group.field(table, &resolved(key), field).cloned()
    }

    pub fn value(&self, table: &str, key: &GlobalKey, field: &str) -> Option<Value> {
        match self.element(table, key, field)? {
            Element::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn int(&self, table: &str, key: &GlobalKey, field: &str) -> Option<i64> {
        match self.value(table, key, field)? {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn string(&self, table: &str, key: &GlobalKey, field: &str) -> Option<String> {
        match self.value(table, key, field)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self, table: &str, key: &GlobalKey, field: &str) -> bool {
        matches!(self.value(table, key, field), Some(Value::Null))
    }

    pub fn list(&self, table: &str, key: &GlobalKey, field: &str) -> Vec<Element> {
        match self.element(table, key, field) {
            Some(Element::List(list)) => list,
            _ => Vec::new(),
        }
    }

    pub fn list_ints(&self, table: &str, key: &GlobalKey, field: &str) -> Vec<i64> {
        self.list(table, key, field)
            .into_iter()
            .filter_map(|e| match e {
                Element::Value(Value::Int(v)) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn list_strings(&self, table: &str, key: &GlobalKey, field: &str) -> Vec<String> {
        self.list(table, key, field)
            .into_iter()
            .filter_map(|e| match e {
                Element::Value(Value::Str(s)) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn set_contains(&self, table: &str, key: &GlobalKey, field: &str, value: Value) -> bool {
        matches!(
            self.element(table, key, field),
            Some(Element::Set(set)) if set.contains(&value)
        )
    }

    pub fn set_len(&self, table: &str, key: &GlobalKey, field: &str) -> usize {
        match self.element(table, key, field) {
            Some(Element::Set(set)) => set.len(),
            _ => 0,
        }
    }

    pub fn dict_value(
        &self,
        table: &str,
        key: &GlobalKey,
        field: &str,
        dict_key: &str,
    ) -> Option<Element> {
        match self.element(table, key, field)? {
            Element::Dict(dict) => dict.get(dict_key).cloned(),
            _ => None,
        }
    }

    pub fn object_count(&self, table: &str) -> usize {
        self.group
            .read()
            .table(table)
            .map_or(0, |t| t.objects.len())
    }

    pub fn has_object(&self, table: &str, key: &GlobalKey) -> bool {
        self.group
            .read()
            .table(table)
            .map_or(false, |t| t.objects.contains_key(&resolved(key)))
    }
}

/// Hooks transformer/applier traces up to `RUST_LOG` for debugging
/// merge walks.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Resolves a wire key whose string form is not interned (the harness
/// only issues integer, UUID, and pair keys).
fn resolved(key: &GlobalKey) -> ResolvedKey {
    match key {
        GlobalKey::Pair { high, low } => ResolvedKey::Pair {
            high: *high,
            low: *low,
        },
        GlobalKey::Int(v) => ResolvedKey::Int(*v),
        GlobalKey::Uuid(u) => ResolvedKey::Uuid(*u),
        GlobalKey::Str(_) => panic!("string keys need a changeset to resolve"),
    }
}

/// One nested-path step for [`Tx::nested`].
#[derive(Clone, Copy, Debug)]
pub enum Step {
    Field(&'static str),
    Index(u32),
}

/// Payload shorthand for transaction builders.
#[derive(Clone, Debug)]
pub enum Val {
    Null,
    Int(i64),
    Bool(bool),
    Double(f64),
    Str(&'static str),
    List,
    Dict,
    Embedded,
    Link(&'static str, GlobalKey),
}

impl From<i64> for Val {
    fn from(v: i64) -> Val {
        Val::Int(v)
    }
}

impl From<bool> for Val {
    fn from(v: bool) -> Val {
        Val::Bool(v)
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Val {
        Val::Double(v)
    }
}

impl From<&'static str> for Val {
    fn from(v: &'static str) -> Val {
        Val::Str(v)
    }
}

/// In-progress local transaction: builds instructions, applies them to
/// the group as they are issued, and leaves the changeset ready to
/// record.
pub struct Tx<'a> {
    group: &'a mut Group,
    changeset: &'a mut Changeset,
    file: FileIdent,
    next_key: &'a mut u64,
}

impl Tx<'_> {
    fn emit(&mut self, instruction: Instruction) {
        apply_one(self.group, self.changeset, &instruction).expect("local apply");
        self.changeset.push(instruction);
    }

    fn pay(&mut self, v: Val) -> Payload {
        match v {
            Val::Null => Payload::Null,
            Val::Int(v) => Payload::Int(v),
            Val::Bool(b) => Payload::Bool(b),
            Val::Double(f) => Payload::Double(f),
            Val::Str(s) => Payload::Str(self.changeset.intern(s)),
            Val::List => Payload::List,
            Val::Dict => Payload::Dictionary,
            Val::Embedded => Payload::EmbeddedObject,
            Val::Link(table, target) => Payload::Link {
                target_table: self.changeset.intern(table),
                target,
            },
        }
    }

    /// Builds a field path, interning the names into this transaction's
    /// changeset.
    pub fn path(&mut self, table: &str, key: &GlobalKey, field: &str) -> Path {
        let table = self.changeset.intern(table);
        let field = self.changeset.intern(field);
        Path::field(table, key.clone(), field)
    }

    /// Extends a path by dictionary/embedded-field and list-index steps.
    pub fn nested(&mut self, base: Path, steps: &[Step]) -> Path {
        let mut path = base;
        for step in steps {
            path = match step {
                Step::Field(name) => {
                    let name = self.changeset.intern(name);
                    path.child(PathElem::Field(name))
                }
                Step::Index(i) => path.child(PathElem::Index(*i)),
            };
        }
        path
    }

    // ---- schema ----

    pub fn add_table(&mut self, name: &str) {
        let table = self.changeset.intern(name);
        self.emit(Instruction::AddTable {
            table,
            ty: TableType::TopLevel { pk: None },
        });
    }

    pub fn add_table_with_pk(&mut self, name: &str, pk_field: &str, ty: ColumnType) {
        let table = self.changeset.intern(name);
        let field = self.changeset.intern(pk_field);
        self.emit(Instruction::AddTable {
            table,
            ty: TableType::TopLevel {
                pk: Some(PrimaryKeySpec {
                    field,
                    ty,
                    nullable: false,
                }),
            },
        });
    }

    pub fn add_embedded_table(&mut self, name: &str) {
        let table = self.changeset.intern(name);
        self.emit(Instruction::AddTable {
            table,
            ty: TableType::Embedded,
        });
    }

    pub fn add_column(&mut self, table: &str, field: &str, ty: ColumnType, nullable: bool) {
        self.add_column_spec(table, field, ty, nullable, CollectionKind::Single, None);
    }

    pub fn add_column_list(&mut self, table: &str, field: &str, ty: ColumnType) {
        self.add_column_spec(table, field, ty, false, CollectionKind::List, None);
    }

    pub fn add_column_dict(&mut self, table: &str, field: &str, ty: ColumnType) {
        self.add_column_spec(table, field, ty, true, CollectionKind::Dictionary, None);
    }

    pub fn add_column_set(&mut self, table: &str, field: &str, ty: ColumnType) {
        self.add_column_spec(table, field, ty, false, CollectionKind::Set, None);
    }

    pub fn add_column_link(&mut self, table: &str, field: &str, target: &str) {
        self.add_column_spec(
            table,
            field,
            ColumnType::Link,
            true,
            CollectionKind::Single,
            Some(target),
        );
    }

    pub fn add_column_link_list(&mut self, table: &str, field: &str, target: &str) {
        self.add_column_spec(
            table,
            field,
            ColumnType::Link,
            false,
            CollectionKind::List,
            Some(target),
        );
    }

    fn add_column_spec(
        &mut self,
        table: &str,
        field: &str,
        ty: ColumnType,
        nullable: bool,
        collection: CollectionKind,
        link_target: Option<&str>,
    ) {
        let table = self.changeset.intern(table);
        let field = self.changeset.intern(field);
        let link_target = link_target.map(|t| self.changeset.intern(t));
        self.emit(Instruction::AddColumn {
            table,
            field,
            spec: ColumnSpec {
                ty,
                nullable,
                collection,
                link_target,
            },
        });
    }

    pub fn erase_column(&mut self, table: &str, field: &str) {
        let table = self.changeset.intern(table);
        let field = self.changeset.intern(field);
        self.emit(Instruction::EraseColumn { table, field });
    }

    pub fn erase_table(&mut self, name: &str) {
        let table = self.changeset.intern(name);
        self.emit(Instruction::EraseTable { table });
    }

    // ---- object lifecycle ----

    pub fn create_object(&mut self, table: &str) -> GlobalKey {
        let key = GlobalKey::pair(self.file, 0, *self.next_key);
        *self.next_key += 1;
        let table = self.changeset.intern(table);
        self.emit(Instruction::CreateObject {
            table,
            object: key.clone(),
        });
        key
    }

    pub fn create_object_with_pk(&mut self, table: &str, pk: i64) -> GlobalKey {
        let key = GlobalKey::Int(pk);
        let table = self.changeset.intern(table);
        self.emit(Instruction::CreateObject {
            table,
            object: key.clone(),
        });
        key
    }

    pub fn erase_object(&mut self, table: &str, key: &GlobalKey) {
        let table = self.changeset.intern(table);
        self.emit(Instruction::EraseObject {
            table,
            object: key.clone(),
        });
    }

    // ---- field and element writes ----

    pub fn set(&mut self, table: &str, key: &GlobalKey, field: &str, v: impl Into<Val>) {
        let path = self.path(table, key, field);
        self.update_at(path, v);
    }

    pub fn set_default(&mut self, table: &str, key: &GlobalKey, field: &str, v: impl Into<Val>) {
        let path = self.path(table, key, field);
        self.update_default_at(path, v);
    }

    pub fn set_null(&mut self, table: &str, key: &GlobalKey, field: &str) {
        self.set(table, key, field, Val::Null);
    }

    pub fn update_at(&mut self, path: Path, v: impl Into<Val>) {
        let value = self.pay(v.into());
        self.emit(Instruction::Update {
            path,
            value,
            is_default: false,
            prior_add: None,
        });
    }

    pub fn update_default_at(&mut self, path: Path, v: impl Into<Val>) {
        let value = self.pay(v.into());
        self.emit(Instruction::Update {
            path,
            value,
            is_default: true,
            prior_add: None,
        });
    }

    pub fn add_int(&mut self, table: &str, key: &GlobalKey, field: &str, delta: i64) {
        let path = self.path(table, key, field);
        self.emit(Instruction::AddInteger { path, delta });
    }

    // ---- lists ----

    fn list_len_at(&self, path: &Path) -> u32 {
        element_at(self.group, self.changeset, path)
            .and_then(Element::as_list)
            .map_or(0, |l| l.len() as u32)
    }

    pub fn list_insert(
        &mut self,
        table: &str,
        key: &GlobalKey,
        field: &str,
        index: u32,
        v: impl Into<Val>,
    ) {
        let path = self.path(table, key, field);
        self.list_insert_at(path, index, v);
    }

    pub fn list_insert_at(&mut self, list: Path, index: u32, v: impl Into<Val>) {
        let prior_size = self.list_len_at(&list);
        let value = self.pay(v.into());
        self.emit(Instruction::ArrayInsert {
            path: list.child(PathElem::Index(index)),
            value,
            prior_size,
        });
    }

    pub fn list_push(&mut self, table: &str, key: &GlobalKey, field: &str, v: impl Into<Val>) {
        let path = self.path(table, key, field);
        let len = self.list_len_at(&path);
        self.list_insert_at(path, len, v);
    }

    pub fn list_erase(&mut self, table: &str, key: &GlobalKey, field: &str, index: u32) {
        let list = self.path(table, key, field);
        let prior_size = self.list_len_at(&list);
        self.emit(Instruction::ArrayErase {
            path: list.child(PathElem::Index(index)),
            prior_size,
        });
    }

    pub fn list_move(&mut self, table: &str, key: &GlobalKey, field: &str, from: u32, to: u32) {
        let list = self.path(table, key, field);
        self.emit(Instruction::ArrayMove {
            path: list.child(PathElem::Index(from)),
            to,
        });
    }

    pub fn list_clear(&mut self, table: &str, key: &GlobalKey, field: &str) {
        let path = self.path(table, key, field);
        self.clear_at(path, ContainerKind::List);
    }

    pub fn clear_at(&mut self, path: Path, collection: ContainerKind) {
        self.emit(Instruction::Clear { path, collection });
    }

    // ---- dictionaries ----

    pub fn dict_set(
        &mut self,
        table: &str,
        key: &GlobalKey,
        field: &str,
        dict_key: &str,
        v: impl Into<Val>,
    ) {
        let base = self.path(table, key, field);
        let k = self.changeset.intern(dict_key);
        self.update_at(base.child(PathElem::Field(k)), v);
    }

    pub fn dict_erase(&mut self, table: &str, key: &GlobalKey, field: &str, dict_key: &str) {
        let base = self.path(table, key, field);
        let k = self.changeset.intern(dict_key);
        let path = base.child(PathElem::Field(k));
        self.emit(Instruction::Update {
            path,
            value: Payload::Erased,
            is_default: false,
            prior_add: None,
        });
    }

    pub fn dict_clear(&mut self, table: &str, key: &GlobalKey, field: &str) {
        let path = self.path(table, key, field);
        self.clear_at(path, ContainerKind::Dictionary);
    }

    // ---- sets ----

    pub fn set_insert(&mut self, table: &str, key: &GlobalKey, field: &str, v: impl Into<Val>) {
        let path = self.path(table, key, field);
        self.set_insert_at(path, v);
    }

    pub fn set_insert_at(&mut self, path: Path, v: impl Into<Val>) {
        let value = self.pay(v.into());
        self.emit(Instruction::SetInsert { path, value });
    }

    pub fn set_erase(&mut self, table: &str, key: &GlobalKey, field: &str, v: impl Into<Val>) {
        let path = self.path(table, key, field);
        self.set_erase_at(path, v);
    }

    pub fn set_erase_at(&mut self, path: Path, v: impl Into<Val>) {
        let value = self.pay(v.into());
        self.emit(Instruction::SetErase { path, value });
    }

    pub fn set_clear(&mut self, table: &str, key: &GlobalKey, field: &str) {
        let path = self.path(table, key, field);
        self.clear_at(path, ContainerKind::Set);
    }
}

fn element_at<'g>(group: &'g Group, changeset: &Changeset, path: &Path) -> Option<&'g Element> {
    let table = changeset.lookup(path.table);
    let key = match &path.object {
        GlobalKey::Str(s) => ResolvedKey::Str(changeset.lookup(*s).to_string()),
        other => resolved(other),
    };
    let field = changeset.lookup(path.field);
    let mut current = group.field(table, &key, field)?;
    for elem in &path.suffix {
        current = match (elem, current) {
            (PathElem::Field(s), Element::Dict(d)) => d.get(changeset.lookup(*s))?,
            (PathElem::Field(s), Element::Object(o)) => o.get(changeset.lookup(*s))?,
            (PathElem::Index(i), Element::List(l)) => l.get(*i as usize)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Uploads every client's pending entries to the server, then downloads
/// everything back, one changeset at a time.
pub fn synchronize(server: &mut Peer, clients: &mut [&mut Peer]) -> Result<()> {
    for client in clients.iter_mut() {
        while server.integrate_next_from(client)? {}
    }
    for client in clients.iter_mut() {
        while client.integrate_next_from(server)? {}
    }
    Ok(())
}

/// Asserts that every peer's group is bit-identical.
pub fn assert_converged(peers: &[&Peer]) -> Result<()> {
    let reference = peers[0].group.read().clone();
    for peer in &peers[1..] {
        let group = peer.group.read();
        ensure!(
            reference == *group,
            "peer {:?} diverged:\n{:#?}\n!=\n{:#?}",
            peer.file,
            reference,
            *group
        );
    }
    Ok(())
}

/// A server plus `n` clients whose upload order is permuted, for the
/// convergence (associativity) property.
pub struct Fleet {
    pub server: Peer,
    pub clients: Vec<Peer>,
    order: Vec<usize>,
}

impl Fleet {
    fn new(n: usize, order: Vec<usize>) -> Fleet {
        Fleet {
            server: Peer::server(),
            clients: (0..n).map(|i| Peer::client(2 + i as u64)).collect(),
            order,
        }
    }

    pub fn client(&mut self, i: usize) -> &mut Peer {
        &mut self.clients[i]
    }

    /// Uploads all clients in the permuted order, then downloads
    /// everything back.
    pub fn sync_all(&mut self) -> Result<()> {
        for &i in &self.order {
            while self.server.integrate_next_from(&self.clients[i])? {}
        }
        for client in &mut self.clients {
            while client.integrate_next_from(&self.server)? {}
        }
        Ok(())
    }

    pub fn assert_converged(&self) -> Result<()> {
        let mut peers: Vec<&Peer> = vec![&self.server];
        peers.extend(self.clients.iter());
        assert_converged(&peers)
    }
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut items: Vec<usize> = (0..n).collect();
    permute(&mut items, 0, &mut out);
    out
}

fn permute(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
    if k == items.len() {
        out.push(items.clone());
        return;
    }
    for i in k..items.len() {
        items.swap(k, i);
        permute(items, k + 1, out);
        items.swap(k, i);
    }
}

/// Runs `f` once per permutation of the clients' upload order. The
/// closure builds the same concurrent history every time; the final
/// groups must agree regardless of the order chosen.
pub fn for_each_permutation<F>(n: usize, mut f: F) -> Result<()>
where
    F: FnMut(&mut Fleet) -> Result<()>,
{
    for order in permutations(n) {
        let mut fleet = Fleet::new(n, order.clone());
        f(&mut fleet).map_err(|e| e.context(format!("upload order {:?}", order)))?;
    }
    Ok(())
}
