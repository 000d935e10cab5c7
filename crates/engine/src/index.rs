//! Optional secondary indexes
//!
//! Indexing is OPTIONAL. Queries work without it (via a TOC scan). When an
//! index covering a `field == literal` predicate is attached, the planner
//! asks it for candidate keys instead of decoding every live entity.
//!
//! The store keeps attached indexes current: every add and update hands
//! the entity's document tree to [`SecondaryIndex::on_upsert`], every
//! delete calls [`SecondaryIndex::on_remove`]. Entities written before the
//! index was attached are picked up by `Store::reindex`.

use parking_lot::RwLock;
use rackdb_core::{EntityKey, FieldPath, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Lookup structure mapping field values to entity keys.
///
/// # Thread Safety
///
/// Maintenance hooks run on whichever thread performs the mutation, while
/// queries look up concurrently.
pub trait SecondaryIndex: Send + Sync {
    /// Field paths this index can answer for.
    fn indexed_paths(&self) -> Vec<FieldPath>;

    /// Keys whose field at `path` equals `value`.
    ///
    /// An empty result for a covered path means no entity matches. A field
    /// that is missing or not a scalar equals [`Value::Null`], so a `Null`
    /// lookup must return those entities too.
    fn lookup(&self, path: &FieldPath, value: &Value) -> Vec<EntityKey>;

    /// Entity `key` was written with the given document tree.
    fn on_upsert(&self, key: EntityKey, document: &serde_json::Value);

    /// Entity `key` was deleted.
    fn on_remove(&self, key: &EntityKey);

    /// Forget every entry.
    fn clear(&self);

    /// True if `path` is one of [`SecondaryIndex::indexed_paths`].
    fn covers(&self, path: &FieldPath) -> bool {
        self.indexed_paths().iter().any(|p| p == path)
    }
}

// ============================================================================
// FieldIndex
// ============================================================================

#[derive(Debug, Default)]
struct FieldIndexState {
    /// One sorted `(value, key)` column per indexed path
    columns: Vec<Vec<(Value, EntityKey)>>,
    /// Indexed values per key, by column; needed to find stale entries
    by_key: HashMap<EntityKey, Vec<Value>>,
}

fn entry_cmp(a: &(Value, EntityKey), b: &(Value, EntityKey)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

impl FieldIndexState {
    fn insert(&mut self, column: usize, value: Value, key: EntityKey) {
        let entry = (value, key);
        let col = &mut self.columns[column];
        let pos = col
            .binary_search_by(|existing| entry_cmp(existing, &entry))
            .unwrap_or_else(|pos| pos);
        col.insert(pos, entry);
    }

    fn remove(&mut self, column: usize, value: Value, key: EntityKey) {
        let entry = (value, key);
        let col = &mut self.columns[column];
        if let Ok(pos) = col.binary_search_by(|existing| entry_cmp(existing, &entry)) {
            col.remove(pos);
        }
    }

    fn unindex(&mut self, key: &EntityKey) {
        if let Some(values) = self.by_key.remove(key) {
            for (column, value) in values.into_iter().enumerate() {
                self.remove(column, value, *key);
            }
        }
    }
}

/// Sorted-column equality index over scalar fields.
///
/// Each indexed path keeps a `Vec<(Value, EntityKey)>` in [`Value::total_cmp`]
/// order; lookups binary-search the equal range. Fields that are missing or
/// not scalar are indexed as [`Value::Null`], the value a filter sees.
#[derive(Debug)]
pub struct FieldIndex {
    paths: Vec<FieldPath>,
    state: RwLock<FieldIndexState>,
}

impl FieldIndex {
    /// Index the given dotted field paths.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<FieldPath>,
    {
        let paths: Vec<FieldPath> = paths.into_iter().map(Into::into).collect();
        let state = FieldIndexState {
            columns: vec![Vec::new(); paths.len()],
            by_key: HashMap::new(),
        };
        FieldIndex {
            paths,
            state: RwLock::new(state),
        }
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        self.state.read().by_key.len()
    }

    /// True if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecondaryIndex for FieldIndex {
    fn indexed_paths(&self) -> Vec<FieldPath> {
        self.paths.clone()
    }

    fn lookup(&self, path: &FieldPath, value: &Value) -> Vec<EntityKey> {
        let column = match self.paths.iter().position(|p| p == path) {
            Some(column) => column,
            None => return Vec::new(),
        };
        let state = self.state.read();
        let col = &state.columns[column];
        let start = col.partition_point(|(v, _)| v.total_cmp(value) == Ordering::Less);
        let end = col.partition_point(|(v, _)| v.total_cmp(value) != Ordering::Greater);
        col[start..end].iter().map(|(_, key)| *key).collect()
    }

    fn on_upsert(&self, key: EntityKey, document: &serde_json::Value) {
        let values: Vec<Value> = self
            .paths
            .iter()
            .map(|path| path.resolve_value(document).unwrap_or(Value::Null))
            .collect();

        let mut state = self.state.write();
        state.unindex(&key);
        for (column, value) in values.iter().enumerate() {
            state.insert(column, value.clone(), key);
        }
        state.by_key.insert(key, values);
    }

    fn on_remove(&self, key: &EntityKey) {
        self.state.write().unindex(key);
    }

    fn clear(&self) {
        let mut state = self.state.write();
        state.columns.iter_mut().for_each(Vec::clear);
        state.by_key.clear();
    }
}
