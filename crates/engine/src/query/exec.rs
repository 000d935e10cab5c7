//! Row sources and operator adapters
//!
//! Rows are `Result<T>`: a decode error travels down the pipeline and ends
//! the query at the terminal. Sorting is the only stage that buffers.

use super::plan::{Planned, Strategy};
use super::{Filter, SortKey, Stage};
use crate::codec::EntityCodec;
use crate::store::Store;
use rackdb_core::{EntityKey, Result, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::iter;

pub(crate) type Rows<'s, T> = Box<dyn Iterator<Item = Result<T>> + 's>;

/// Decode rows for the planned keys, skipping entries deleted meanwhile
pub(crate) fn source<'s, T, C>(store: &'s Store<C>, planned: Planned) -> Rows<'s, T>
where
    T: DeserializeOwned + 's,
    C: EntityCodec,
{
    let eager = matches!(planned.plan.strategy, Strategy::Materialized { .. });
    let rows = decode(store, planned.keys);
    if eager {
        match rows.collect::<Result<Vec<T>>>() {
            Ok(all) => Box::new(all.into_iter().map(Ok)),
            Err(e) => Box::new(iter::once(Err(e))),
        }
    } else {
        Box::new(rows)
    }
}

fn decode<'s, T, C>(
    store: &'s Store<C>,
    keys: Vec<EntityKey>,
) -> impl Iterator<Item = Result<T>> + 's
where
    T: DeserializeOwned + 's,
    C: EntityCodec,
{
    keys.into_iter()
        .filter_map(move |key| match store.decode_entry::<T>(key) {
            Ok(Some((_, entity))) => Some(Ok(entity)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        })
}

pub(crate) fn apply<'s, T>(rows: Rows<'s, T>, stage: Stage<'s, T>) -> Rows<'s, T>
where
    T: Serialize + 's,
{
    match stage {
        Stage::Filter(Filter::Fn(pred)) => {
            Box::new(rows.filter(move |row| row.as_ref().map_or(true, |t| pred(t))))
        }
        Stage::Filter(Filter::Expr(expr)) => Box::new(rows.filter_map(move |row| {
            let entity = match row {
                Ok(entity) => entity,
                Err(e) => return Some(Err(e)),
            };
            match serde_json::to_value(&entity) {
                Ok(doc) => expr.matches(&doc).then_some(Ok(entity)),
                Err(e) => Some(Err(e.into())),
            }
        })),
        Stage::Sort(key) => match sorted(rows, key) {
            Ok(all) => Box::new(all.into_iter().map(Ok)),
            Err(e) => Box::new(iter::once(Err(e))),
        },
        Stage::Skip(n) => Box::new(rows.skip(n)),
        Stage::Take(n) => Box::new(rows.take(n)),
    }
}

/// Stable sort; ties keep source order
fn sorted<'s, T: Serialize>(rows: Rows<'s, T>, key: SortKey<'s, T>) -> Result<Vec<T>> {
    let mut all = rows.collect::<Result<Vec<T>>>()?;
    match key {
        SortKey::Fn(cmp) => all.sort_by(|a, b| cmp(a, b)),
        SortKey::Path { path, descending } => {
            let mut keyed = all
                .into_iter()
                .map(|entity| {
                    let doc = serde_json::to_value(&entity)?;
                    Ok((path.resolve_value(&doc).unwrap_or(Value::Null), entity))
                })
                .collect::<Result<Vec<(Value, T)>>>()?;
            keyed.sort_by(|(a, _), (b, _)| {
                let ord = a.total_cmp(b);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            all = keyed.into_iter().map(|(_, entity)| entity).collect();
        }
    }
    Ok(all)
}

/// Fold the scalar at `path` of every row, skipping missing values
pub(crate) fn fold_field<T, A>(
    rows: Rows<'_, T>,
    path: &rackdb_core::FieldPath,
    init: A,
    mut f: impl FnMut(A, Value) -> A,
) -> Result<A>
where
    T: Serialize,
{
    let mut acc = init;
    for row in rows {
        let doc = serde_json::to_value(row?)?;
        match path.resolve_value(&doc) {
            Some(Value::Null) | None => {}
            Some(value) => acc = f(acc, value),
        }
    }
    Ok(acc)
}

/// The extreme of two values under `wanted`
pub(crate) fn pick(current: Option<Value>, candidate: Value, wanted: Ordering) -> Option<Value> {
    match current {
        Some(current) if candidate.total_cmp(&current) != wanted => Some(current),
        _ => Some(candidate),
    }
}
