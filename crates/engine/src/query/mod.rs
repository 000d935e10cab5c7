//! Declarative queries over stored entities
//!
//! A [`Query`] records an operator chain and runs nothing until a terminal
//! (`to_vec`, `iter`, `count`, `first`, aggregates) is called. At that
//! point the planner picks a row source once and the operators are applied
//! as iterator adapters over it.
//!
//! ```ignore
//! use rackdb_engine::query::field;
//!
//! let adults: Vec<Person> = store
//!     .query::<Person>()
//!     .filter(field("age").ge(18))
//!     .order_by("name")
//!     .take(10)
//!     .to_vec()?;
//! ```

mod exec;
pub mod expr;
mod plan;

pub use expr::{field, lit, CmpOp, Expr};
pub use plan::{QueryPlan, Strategy};

use crate::codec::EntityCodec;
use crate::store::Store;
use exec::Rows;
use rackdb_core::{FieldPath, Result, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

type Predicate<'s, T> = Box<dyn Fn(&T) -> bool + 's>;
type Comparator<'s, T> = Box<dyn Fn(&T, &T) -> Ordering + 's>;

pub(crate) enum Filter<'s, T> {
    Expr(Expr),
    Fn(Predicate<'s, T>),
}

pub(crate) enum SortKey<'s, T> {
    Path { path: FieldPath, descending: bool },
    Fn(Comparator<'s, T>),
}

pub(crate) enum Stage<'s, T> {
    Filter(Filter<'s, T>),
    Sort(SortKey<'s, T>),
    Skip(usize),
    Take(usize),
}

impl<T> Stage<'_, T> {
    fn describe(&self) -> String {
        match self {
            Stage::Filter(Filter::Expr(expr)) => format!("filter {}", expr),
            Stage::Filter(Filter::Fn(_)) => "filter <fn>".to_string(),
            Stage::Sort(SortKey::Path {
                path,
                descending: false,
            }) => format!("order_by {}", path),
            Stage::Sort(SortKey::Path {
                path,
                descending: true,
            }) => format!("order_by_desc {}", path),
            Stage::Sort(SortKey::Fn(_)) => "order_by <fn>".to_string(),
            Stage::Skip(n) => format!("skip {}", n),
            Stage::Take(n) => format!("take {}", n),
        }
    }
}

/// Lazily evaluated query over entities of type `T`
pub struct Query<'s, T, C: EntityCodec> {
    store: &'s Store<C>,
    stages: Vec<Stage<'s, T>>,
    threshold: usize,
}

impl<T, C: EntityCodec> fmt::Debug for Query<'_, T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<String> = self.stages.iter().map(Stage::describe).collect();
        f.debug_struct("Query")
            .field("stages", &stages)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl<'s, T, C: EntityCodec> Query<'s, T, C> {
    pub(crate) fn new(store: &'s Store<C>) -> Self {
        Query {
            store,
            stages: Vec::new(),
            threshold: store.config().materialize_threshold,
        }
    }

    fn stage(mut self, stage: Stage<'s, T>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Keep entities matching `expr`
    pub fn filter(self, expr: Expr) -> Self {
        self.stage(Stage::Filter(Filter::Expr(expr)))
    }

    /// Keep entities for which `pred` holds
    ///
    /// Opaque to the planner: never used for index lookups.
    pub fn filter_fn<F>(self, pred: F) -> Self
    where
        F: Fn(&T) -> bool + 's,
    {
        self.stage(Stage::Filter(Filter::Fn(Box::new(pred))))
    }

    /// Sort ascending by the field at `path`
    pub fn order_by(self, path: &str) -> Self {
        self.stage(Stage::Sort(SortKey::Path {
            path: FieldPath::parse(path),
            descending: false,
        }))
    }

    /// Sort descending by the field at `path`
    pub fn order_by_desc(self, path: &str) -> Self {
        self.stage(Stage::Sort(SortKey::Path {
            path: FieldPath::parse(path),
            descending: true,
        }))
    }

    /// Sort with a comparator
    pub fn order_by_fn<F>(self, cmp: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + 's,
    {
        self.stage(Stage::Sort(SortKey::Fn(Box::new(cmp))))
    }

    /// Drop the first `n` rows
    pub fn skip(self, n: usize) -> Self {
        self.stage(Stage::Skip(n))
    }

    /// Keep at most `n` rows
    pub fn take(self, n: usize) -> Self {
        self.stage(Stage::Take(n))
    }

    /// Override the store's materialization threshold for this query
    pub fn materialize_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// The plan a terminal would run, without decoding anything
    pub fn explain(&self) -> Result<QueryPlan> {
        Ok(plan::plan(self.store, &self.stages, self.threshold)?.plan)
    }
}

impl<'s, T, C> Query<'s, T, C>
where
    T: Serialize + DeserializeOwned + 's,
    C: EntityCodec,
{
    fn run(self) -> Result<Rows<'s, T>> {
        let planned = plan::plan(self.store, &self.stages, self.threshold)?;
        let mut rows = exec::source(self.store, planned);
        for stage in self.stages {
            rows = exec::apply(rows, stage);
        }
        Ok(rows)
    }

    /// Run and iterate; each item is a decoded entity or the error that
    /// stopped decoding
    pub fn iter(self) -> Result<QueryIter<'s, T>> {
        Ok(QueryIter { rows: self.run()? })
    }

    /// Run and collect
    pub fn to_vec(self) -> Result<Vec<T>> {
        self.run()?.collect()
    }

    /// Number of matching entities
    pub fn count(self) -> Result<usize> {
        let mut n = 0;
        for row in self.run()? {
            row?;
            n += 1;
        }
        Ok(n)
    }

    /// First matching entity
    pub fn first(self) -> Result<Option<T>> {
        self.take(1).run()?.next().transpose()
    }

    /// True if any entity matches
    pub fn any(self) -> Result<bool> {
        Ok(self.first()?.is_some())
    }

    /// True if `pred` holds for every matching entity
    pub fn all<F: FnMut(&T) -> bool>(self, mut pred: F) -> Result<bool> {
        for row in self.run()? {
            if !pred(&row?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Project each matching entity
    pub fn select<U, F: FnMut(T) -> U>(self, mut f: F) -> Result<Vec<U>> {
        self.run()?.map(|row| row.map(&mut f)).collect()
    }

    /// Sum of the numeric field at `path`; other values are ignored
    pub fn sum(self, path: &str) -> Result<f64> {
        let path = FieldPath::parse(path);
        exec::fold_field(self.run()?, &path, 0.0, |acc, value| {
            acc + value.as_f64().unwrap_or(0.0)
        })
    }

    /// Smallest non-null value at `path`
    pub fn min(self, path: &str) -> Result<Option<Value>> {
        let path = FieldPath::parse(path);
        exec::fold_field(self.run()?, &path, None, |acc, value| {
            exec::pick(acc, value, Ordering::Less)
        })
    }

    /// Largest non-null value at `path`
    pub fn max(self, path: &str) -> Result<Option<Value>> {
        let path = FieldPath::parse(path);
        exec::fold_field(self.run()?, &path, None, |acc, value| {
            exec::pick(acc, value, Ordering::Greater)
        })
    }
}

/// Iterator over query results
pub struct QueryIter<'s, T> {
    rows: Rows<'s, T>,
}

impl<T> Iterator for QueryIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

impl<T> fmt::Debug for QueryIter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FieldIndex;
    use crate::store::StoreConfig;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct City {
        name: String,
        country: String,
        population: i64,
    }

    fn city(name: &str, country: &str, population: i64) -> City {
        City {
            name: name.to_string(),
            country: country.to_string(),
            population,
        }
    }

    fn seeded(dir: &TempDir) -> Store {
        let store =
            Store::open_with_config(dir.path().join("cities.rdb"), StoreConfig::for_testing())
                .unwrap();
        for c in [
            city("Oslo", "NO", 700_000),
            city("Bergen", "NO", 285_000),
            city("Rome", "IT", 2_800_000),
            city("Milan", "IT", 1_400_000),
            city("Lyon", "FR", 520_000),
        ] {
            store.add(&c).unwrap();
        }
        store
    }

    fn names(cities: Vec<City>) -> Vec<String> {
        cities.into_iter().map(|c| c.name).collect()
    }

    #[test]
    fn test_filter_keeps_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);
        let found = store
            .query::<City>()
            .filter(field("population").gt(600_000))
            .to_vec()
            .unwrap();
        assert_eq!(names(found), ["Oslo", "Rome", "Milan"]);
    }

    #[test]
    fn test_order_skip_take() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);
        let page = store
            .query::<City>()
            .order_by_desc("population")
            .skip(1)
            .take(2)
            .to_vec()
            .unwrap();
        assert_eq!(names(page), ["Milan", "Oslo"]);

        let by_name = store
            .query::<City>()
            .order_by_fn(|a, b| a.name.cmp(&b.name))
            .select(|c| c.name)
            .unwrap();
        assert_eq!(by_name, ["Bergen", "Lyon", "Milan", "Oslo", "Rome"]);
    }

    #[test]
    fn test_terminals() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);

        assert_eq!(
            store.query::<City>().filter(field("country").eq("NO")).count().unwrap(),
            2
        );
        assert_eq!(
            store
                .query::<City>()
                .filter_fn(|c| c.name.starts_with('M'))
                .first()
                .unwrap(),
            Some(city("Milan", "IT", 1_400_000))
        );
        assert!(!store.query::<City>().filter(field("country").eq("SE")).any().unwrap());
        assert!(store.query::<City>().all(|c| c.population > 100_000).unwrap());
        assert_eq!(
            store
                .query::<City>()
                .filter(field("country").eq("IT"))
                .sum("population")
                .unwrap(),
            4_200_000.0
        );
        assert_eq!(store.query::<City>().min("name").unwrap(), Some(Value::from("Bergen")));
        assert_eq!(
            store.query::<City>().max("population").unwrap(),
            Some(Value::Int(2_800_000))
        );
        assert_eq!(store.query::<City>().min("missing").unwrap(), None);
    }

    #[test]
    fn test_explain_reports_strategy() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);

        let plan = store.query::<City>().explain().unwrap();
        assert_eq!(plan.strategy, Strategy::Materialized { entries: 5 });

        let plan = store
            .query::<City>()
            .materialize_threshold(2)
            .explain()
            .unwrap();
        assert_eq!(plan.strategy, Strategy::Streaming { entries: 5 });

        store.attach_index(Arc::new(FieldIndex::new(["country"])));
        store.reindex::<City>().unwrap();
        let plan = store
            .query::<City>()
            .filter(field("country").eq("NO").and(field("population").gt(1)))
            .take(1)
            .explain()
            .unwrap();
        assert_eq!(
            plan.strategy,
            Strategy::Indexed {
                path: FieldPath::parse("country"),
                value: Value::from("NO"),
                candidates: 2,
            }
        );
        assert_eq!(plan.operators.len(), 2);
    }

    #[test]
    fn test_filter_after_take_is_not_an_index_candidate() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);
        store.attach_index(Arc::new(FieldIndex::new(["country"])));
        store.reindex::<City>().unwrap();

        let query = store
            .query::<City>()
            .take(3)
            .filter(field("country").eq("FR"));
        assert!(query.explain().unwrap().index_candidates.is_empty());
        assert!(query.to_vec().unwrap().is_empty());
    }

    #[test]
    fn test_deleted_entities_are_not_returned() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);
        let rome = store
            .keys()
            .unwrap()
            .into_iter()
            .find(|k| store.get::<City>(k).unwrap().is_some_and(|c| c.name == "Rome"))
            .unwrap();
        store.delete(&rome).unwrap();

        let all = store.query::<City>().materialize_threshold(0).to_vec().unwrap();
        assert_eq!(names(all), ["Oslo", "Bergen", "Milan", "Lyon"]);
    }
}
