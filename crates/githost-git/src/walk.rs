//! Object graph traversal.
//!
//! Walks follow commit parents and trees, tree entries (gitlinks are never
//! followed) and tag targets. Every walk is iterative with a visited set, so
//! shared subtrees and merge-heavy histories are visited once.

use crate::Result;
use githost_storage::{ObjectId, ObjectStore, ObjectType, StorageError};
use std::collections::{BTreeSet, HashSet};

/// An insertion-ordered set of objects with their types.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    entries: Vec<(ObjectId, ObjectType)>,
    index: HashSet<ObjectId>,
}

impl ObjectSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object; returns false if it was already present.
    pub fn insert(&mut self, id: ObjectId, kind: ObjectType) -> bool {
        if !self.index.insert(id) {
            return false;
        }
        self.entries.push((id, kind));
        true
    }

    /// True when `id` is in the set.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(ObjectId, ObjectType)> {
        self.entries.iter()
    }

    /// Just the ids, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }
}

/// Reachability queries against one object store.
#[derive(Debug, Clone, Copy)]
pub struct ReachabilityWalker<'a> {
    store: &'a ObjectStore,
}

impl<'a> ReachabilityWalker<'a> {
    /// Creates a walker over `store`.
    pub fn new(store: &'a ObjectStore) -> Self {
        Self { store }
    }

    /// Everything reachable from `roots`, roots included.
    ///
    /// Fails with `ObjectNotFound` if any reachable object is absent.
    pub fn reachable_from(&self, roots: &[ObjectId]) -> Result<ObjectSet> {
        self.walk(roots, &HashSet::new())
    }

    /// Everything reachable from `roots` that is not reachable from
    /// `boundary`. Boundary objects the store does not have are ignored.
    pub fn reachable_excluding(&self, roots: &[ObjectId], boundary: &[ObjectId]) -> Result<ObjectSet> {
        if boundary.is_empty() {
            return self.reachable_from(roots);
        }
        let known: Vec<ObjectId> = boundary
            .iter()
            .copied()
            .filter(|id| self.store.exists(id))
            .collect();
        let excluded: HashSet<ObjectId> = self.reachable_from(&known)?.ids().collect();
        self.walk(roots, &excluded)
    }

    /// Ids reachable from `tip` that the store does not have.
    pub fn missing_descendants(&self, tip: ObjectId) -> Result<BTreeSet<ObjectId>> {
        self.missing_descendants_bounded(tip, &[])
    }

    /// Like [`missing_descendants`](Self::missing_descendants), but objects
    /// reachable from `complete` are trusted to be present along with their
    /// history and are not entered. Passing the current ref tips keeps push
    /// validation proportional to what was pushed.
    pub fn missing_descendants_bounded(
        &self,
        tip: ObjectId,
        complete: &[ObjectId],
    ) -> Result<BTreeSet<ObjectId>> {
        let stop: HashSet<ObjectId> = complete.iter().copied().collect();
        let mut missing = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack = vec![tip];

        while let Some(id) = stack.pop() {
            if stop.contains(&id) || !visited.insert(id) {
                continue;
            }
            let object = match self.store.try_get(&id)? {
                Some(object) => object,
                None => {
                    missing.insert(id);
                    continue;
                }
            };
            for (child, _) in object.parse()?.children() {
                if !visited.contains(&child) {
                    stack.push(child);
                }
            }
        }

        if !missing.is_empty() {
            tracing::debug!(%tip, missing = missing.len(), "tip has missing descendants");
        }
        Ok(missing)
    }

    fn walk(&self, roots: &[ObjectId], excluded: &HashSet<ObjectId>) -> Result<ObjectSet> {
        let mut set = ObjectSet::new();
        let mut stack: Vec<ObjectId> = roots.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            if excluded.contains(&id) || set.contains(&id) {
                continue;
            }
            let object = self
                .store
                .try_get(&id)?
                .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))?;
            let parsed = object.parse()?;
            set.insert(id, object.object_type);

            let children = parsed.children();
            for (child, _) in children.into_iter().rev() {
                if !set.contains(&child) && !excluded.contains(&child) {
                    stack.push(child);
                }
            }
        }
        Ok(set)
    }
}
