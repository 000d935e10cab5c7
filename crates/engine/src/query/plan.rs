//! Strategy selection
//!
//! 1. Collect `field == literal` conjuncts from filters that run before any
//!    `skip`/`take` (later filters see a truncated stream and cannot narrow
//!    the source).
//! 2. If an attached index covers one of them, the source is that index's
//!    keys.
//! 3. Otherwise the source is every live TOC entry, decoded eagerly when
//!    there are at most `materialize_threshold` of them and lazily beyond.
//!
//! Every filter is still applied to the source rows; the index only narrows
//! what gets decoded.

use super::{Filter, Stage};
use crate::codec::EntityCodec;
use crate::store::Store;
use rackdb_core::{EntityKey, FieldPath, Result, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// How the rows of a query are produced
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Candidate keys come from a secondary index
    Indexed {
        /// Indexed field
        path: FieldPath,
        /// Looked-up value
        value: Value,
        /// Live keys the index returned
        candidates: usize,
    },
    /// All live entries are decoded up front
    Materialized {
        /// Live entries at planning time
        entries: usize,
    },
    /// Live entries are decoded one at a time as the result is consumed
    Streaming {
        /// Live entries at planning time
        entries: usize,
    },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Indexed {
                path,
                value,
                candidates,
            } => write!(f, "indexed({} == {}, {} candidates)", path, value, candidates),
            Strategy::Materialized { entries } => write!(f, "materialized({} entries)", entries),
            Strategy::Streaming { entries } => write!(f, "streaming({} entries)", entries),
        }
    }
}

/// Result of planning a query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Chosen row source
    pub strategy: Strategy,
    /// `field == literal` conjuncts eligible for index lookup
    pub index_candidates: Vec<(FieldPath, Value)>,
    /// Operators applied to the rows, in order
    pub operators: Vec<String>,
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.strategy)?;
        for op in &self.operators {
            write!(f, " -> {}", op)?;
        }
        Ok(())
    }
}

/// A plan plus the keys to decode, in file order
pub(crate) struct Planned {
    pub plan: QueryPlan,
    pub keys: Vec<EntityKey>,
}

pub(crate) fn plan<T, C: EntityCodec>(
    store: &Store<C>,
    stages: &[Stage<'_, T>],
    threshold: usize,
) -> Result<Planned> {
    store.wait_ready()?;

    let mut index_candidates = Vec::new();
    for stage in stages {
        match stage {
            Stage::Filter(Filter::Expr(expr)) => expr.equality_candidates(&mut index_candidates),
            Stage::Skip(_) | Stage::Take(_) => break,
            _ => {}
        }
    }
    let operators = stages.iter().map(Stage::describe).collect();

    let indexes = store.indexes();
    let covered = index_candidates.iter().find_map(|(path, value)| {
        indexes
            .iter()
            .find(|index| index.covers(path))
            .map(|index| (path.clone(), value.clone(), index.lookup(path, value)))
    });

    let toc = store.toc();
    let (strategy, keys) = match covered {
        Some((path, value, found)) => {
            let mut seen = HashSet::new();
            let mut entries: Vec<_> = found
                .into_iter()
                .filter(|key| seen.insert(*key))
                .filter_map(|key| toc.try_get_entry(&key))
                .filter(|entry| !entry.is_free)
                .collect();
            entries.sort_by_key(|entry| entry.offset);
            let strategy = Strategy::Indexed {
                path,
                value,
                candidates: entries.len(),
            };
            (strategy, entries.iter().map(|e| e.key).collect())
        }
        None => {
            let keys: Vec<EntityKey> = toc.active_entries().iter().map(|e| e.key).collect();
            let entries = keys.len();
            let strategy = if entries <= threshold {
                Strategy::Materialized { entries }
            } else {
                Strategy::Streaming { entries }
            };
            (strategy, keys)
        }
    };

    let plan = QueryPlan {
        strategy,
        index_candidates,
        operators,
    };
    debug!(plan = %plan, "planned query");
    Ok(Planned { plan, keys })
}
