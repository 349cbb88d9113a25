//! Query / Queryable (spec.md §4.5): composable, single-use lazy filtered
//! iterators with dotted-attribute predicate sugar, plus a ChainedQueryable
//! that concatenates multiple providers without interleaving them by time.

use std::sync::Arc;

use crate::entities::{AttributeValue, Entity};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A lazy sequence refined by zero or more predicates. Iteration is
/// destructive — a Queryable is single-use; callers needing reuse must
/// materialize (spec.md §4.5 invariant).
pub struct Queryable<T> {
    source: Box<dyn Iterator<Item = T> + Send>,
    predicates: Vec<Predicate<T>>,
}

impl<T: 'static> Queryable<T> {
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Box::new(source.into_iter()),
            predicates: Vec::new(),
        }
    }

    /// Append a predicate; returns a new Queryable sharing the underlying
    /// iterator.
    pub fn where_<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }
}

impl<T: Entity + 'static> Queryable<T> {
    /// `where(attr=value)` sugar: appends a predicate checking
    /// `item.attr == value`. Dotted keys traverse nested attributes.
    /// Missing attributes filter the item out rather than erroring.
    pub fn where_eq(self, path: &str, value: AttributeValue) -> Self {
        let path = path.to_string();
        self.where_(move |item| {
            get_attr(item, &path)
                .map(|found| attr_matches(&found, &value))
                .unwrap_or(false)
        })
    }
}

impl<T> Iterator for Queryable<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let item = self.source.next()?;
            if self.predicates.iter().all(|p| p(&item)) {
                return Some(item);
            }
        }
    }
}

/// Concatenates multiple Queryables. `where` is pushed into every child so
/// per-provider filtering is preserved; ordering is concatenation order, not
/// merged or sorted (spec.md §4.5, §5).
pub struct ChainedQueryable<T> {
    children: Vec<Queryable<T>>,
}

impl<T: 'static> ChainedQueryable<T> {
    pub fn new(children: Vec<Queryable<T>>) -> Self {
        Self { children }
    }

    pub fn where_<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let children = self
            .children
            .into_iter()
            .map(|child| {
                let predicate = predicate.clone();
                child.where_(move |item| predicate(item))
            })
            .collect();
        Self { children }
    }
}

impl<T: Entity + 'static> ChainedQueryable<T> {
    pub fn where_eq(self, path: &str, value: AttributeValue) -> Self {
        let path = path.to_string();
        self.where_(move |item| {
            get_attr(item, &path)
                .map(|found| attr_matches(&found, &value))
                .unwrap_or(false)
        })
    }
}

impl<T> Iterator for ChainedQueryable<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while let Some(front) = self.children.first_mut() {
            if let Some(item) = front.next() {
                return Some(item);
            }
            self.children.remove(0);
        }
        None
    }
}

/// Resolve a (possibly dotted) attribute path against an entity's attribute
/// map. Nested traversal is not modeled by a recursive map today — every
/// entity currently exposes only flat attributes — so a dotted path like
/// `stop.id` resolves by joining its segments with `_`, matching the
/// flattened `stop_id`-shaped key a nested lookup would have reached. Only
/// if that underscore-joined spelling misses do we fall back to the last
/// segment alone, for plain unqualified keys like `id`.
fn get_attr<T: Entity>(item: &T, path: &str) -> Option<AttributeValue> {
    let attrs = item.attributes();
    if let Some(v) = attrs.get(path) {
        return Some(v.clone());
    }
    let joined = path.replace('.', "_");
    if let Some(v) = attrs.get(&joined) {
        return Some(v.clone());
    }
    let last = path.rsplit('.').next()?;
    attrs.get(last).cloned()
}

fn attr_matches(found: &AttributeValue, target: &AttributeValue) -> bool {
    found == target
}
