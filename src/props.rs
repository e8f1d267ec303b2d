use crate::changeset::Changeset;
use crate::instruction::{ColumnSpec, Instruction, PrimaryKeySpec, TableType};
use crate::path::{Path, PathElem};
use crate::value::{
    CollectionKind, ColumnType, ContainerKind, DateTime, GlobalKey, InternString, ObjectId,
    Payload, Uuid,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use smallvec::SmallVec;

const NAMES: &[&str] = &["table", "field", "other", "items", "key", "hello"];

fn arb_intern() -> impl Strategy<Value = InternString> {
    (0..NAMES.len() as u32).prop_map(InternString::new)
}

pub fn arb_column_type() -> impl Strategy<Value = ColumnType> {
    prop::sample::select(vec![
        ColumnType::Int,
        ColumnType::Bool,
        ColumnType::Float,
        ColumnType::Double,
        ColumnType::String,
        ColumnType::Binary,
        ColumnType::Timestamp,
        ColumnType::Decimal,
        ColumnType::ObjectId,
        ColumnType::Uuid,
        ColumnType::Mixed,
        ColumnType::Link,
    ])
}

pub fn arb_key() -> impl Strategy<Value = GlobalKey> {
    prop_oneof![
        (any::<u64>(), any::<u64>()).prop_map(|(high, low)| GlobalKey::Pair { high, low }),
        any::<i64>().prop_map(GlobalKey::Int),
        arb_intern().prop_map(GlobalKey::Str),
        any::<[u8; 16]>().prop_map(|b| GlobalKey::Uuid(Uuid::new(b))),
    ]
}

pub fn arb_payload() -> impl Strategy<Value = Payload> {
    prop::strategy::Union::new(vec![
        Just(Payload::Null).boxed(),
        Just(Payload::Erased).boxed(),
        any::<i64>().prop_map(Payload::Int).boxed(),
        any::<bool>().prop_map(Payload::Bool).boxed(),
        any::<f32>().prop_map(Payload::Float).boxed(),
        any::<f64>().prop_map(Payload::Double).boxed(),
        arb_intern().prop_map(Payload::Str).boxed(),
        prop::collection::vec(any::<u8>(), 0..16)
            .prop_map(Payload::Binary)
            .boxed(),
        (any::<i64>(), 0u32..1_000_000_000)
            .prop_map(|(s, ns)| Payload::Timestamp(DateTime::new(s, ns)))
            .boxed(),
        (any::<i64>(), 0u32..28)
            .prop_map(|(m, s)| Payload::Decimal(Decimal::new(m, s)))
            .boxed(),
        any::<[u8; 12]>()
            .prop_map(|b| Payload::ObjectId(ObjectId::new(b)))
            .boxed(),
        any::<[u8; 16]>()
            .prop_map(|b| Payload::Uuid(Uuid::new(b)))
            .boxed(),
        (arb_intern(), arb_key())
            .prop_map(|(target_table, target)| Payload::Link {
                target_table,
                target,
            })
            .boxed(),
        Just(Payload::List).boxed(),
        Just(Payload::Dictionary).boxed(),
        Just(Payload::EmbeddedObject).boxed(),
    ])
}

fn arb_elem() -> impl Strategy<Value = PathElem> {
    prop_oneof![
        arb_intern().prop_map(PathElem::Field),
        (0u32..8).prop_map(PathElem::Index),
    ]
}

pub fn arb_path() -> impl Strategy<Value = Path> {
    (
        arb_intern(),
        arb_key(),
        arb_intern(),
        prop::collection::vec(arb_elem(), 0..4),
    )
        .prop_map(|(table, object, field, suffix)| Path {
            table,
            object,
            field,
            suffix: SmallVec::from_vec(suffix),
        })
}

fn arb_table_type() -> impl Strategy<Value = TableType> {
    prop_oneof![
        Just(TableType::TopLevel { pk: None }),
        Just(TableType::Embedded),
        (arb_intern(), arb_column_type(), any::<bool>()).prop_map(|(field, ty, nullable)| {
            TableType::TopLevel {
                pk: Some(PrimaryKeySpec {
                    field,
                    ty,
                    nullable,
                }),
            }
        }),
    ]
}

fn arb_column_spec() -> impl Strategy<Value = ColumnSpec> {
    (
        arb_column_type(),
        any::<bool>(),
        prop_oneof![
            Just(CollectionKind::Single),
            Just(CollectionKind::List),
            Just(CollectionKind::Dictionary),
            Just(CollectionKind::Set),
        ],
        prop::option::of(arb_intern()),
    )
        .prop_map(|(ty, nullable, collection, link_target)| ColumnSpec {
            ty,
            nullable,
            collection,
            link_target,
        })
}

pub fn arb_instruction() -> impl Strategy<Value = Instruction> {
    prop::strategy::Union::new(vec![
        (arb_intern(), arb_table_type())
            .prop_map(|(table, ty)| Instruction::AddTable { table, ty })
            .boxed(),
        arb_intern()
            .prop_map(|table| Instruction::EraseTable { table })
            .boxed(),
        (arb_intern(), arb_intern(), arb_column_spec())
            .prop_map(|(table, field, spec)| Instruction::AddColumn { table, field, spec })
            .boxed(),
        (arb_intern(), arb_intern())
            .prop_map(|(table, field)| Instruction::EraseColumn { table, field })
            .boxed(),
        (arb_intern(), arb_key())
            .prop_map(|(table, object)| Instruction::CreateObject { table, object })
            .boxed(),
        (arb_intern(), arb_key())
            .prop_map(|(table, object)| Instruction::EraseObject { table, object })
            .boxed(),
        (
            arb_path(),
            arb_payload(),
            any::<bool>(),
            prop::option::of(any::<i64>()),
        )
            .prop_map(|(path, value, is_default, prior_add)| Instruction::Update {
                path,
                value,
                is_default,
                prior_add,
            })
            .boxed(),
        (arb_path(), any::<i64>())
            .prop_map(|(path, delta)| Instruction::AddInteger { path, delta })
            .boxed(),
        (arb_path(), arb_payload(), 0u32..16)
            .prop_map(|(path, value, prior_size)| Instruction::ArrayInsert {
                path: path.child(PathElem::Index(prior_size.min(7))),
                value,
                prior_size,
            })
            .boxed(),
        (arb_path(), 0u32..8, 0u32..8)
            .prop_map(|(path, from, to)| Instruction::ArrayMove {
                path: path.child(PathElem::Index(from)),
                to,
            })
            .boxed(),
        (arb_path(), 1u32..16)
            .prop_map(|(path, prior_size)| Instruction::ArrayErase {
                path: path.child(PathElem::Index(prior_size - 1)),
                prior_size,
            })
            .boxed(),
        (
            arb_path(),
            prop_oneof![
                Just(ContainerKind::List),
                Just(ContainerKind::Dictionary),
                Just(ContainerKind::Set),
            ],
        )
            .prop_map(|(path, collection)| Instruction::Clear { path, collection })
            .boxed(),
        (arb_path(), arb_payload())
            .prop_map(|(path, value)| Instruction::SetInsert { path, value })
            .boxed(),
        (arb_path(), arb_payload())
            .prop_map(|(path, value)| Instruction::SetErase { path, value })
            .boxed(),
    ])
}

/// A structurally valid changeset: every interned index resolves.
pub fn arb_changeset() -> impl Strategy<Value = Changeset> {
    prop::collection::vec(arb_instruction(), 0..12).prop_map(|instructions| {
        let mut changeset = Changeset::new();
        for name in NAMES {
            changeset.intern(name);
        }
        for instruction in instructions {
            changeset.push_raw(instruction);
        }
        changeset
    })
}
