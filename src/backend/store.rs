//! In-process inventory of backend objects
//!
//! One [`Inventory`] per (placement, kind), keyed by path and indexed by every
//! tag scope so owner lookups never hit the backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{BackendObject, ObjectKind, Scope};

/// A store that can enumerate the values of one tag scope
#[cfg_attr(test, mockall::automock)]
pub trait IndexedStore: Send + Sync {
    /// Every distinct value recorded under `scope`
    fn list_index_values(&self, scope: &str) -> BTreeSet<String>;

    /// Every object in the store
    fn list(&self) -> Vec<BackendObject>;
}

#[derive(Default)]
struct InventoryInner {
    objects: BTreeMap<String, BackendObject>,
    /// tag scope -> tag value -> paths
    index: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl InventoryInner {
    fn unindex(&mut self, obj: &BackendObject) {
        for tag in &obj.tags {
            if let Some(values) = self.index.get_mut(&tag.scope) {
                if let Some(paths) = values.get_mut(&tag.tag) {
                    paths.remove(&obj.path);
                    if paths.is_empty() {
                        values.remove(&tag.tag);
                    }
                }
                if values.is_empty() {
                    self.index.remove(&tag.scope);
                }
            }
        }
    }

    fn reindex(&mut self, obj: &BackendObject) {
        for tag in &obj.tags {
            self.index
                .entry(tag.scope.clone())
                .or_default()
                .entry(tag.tag.clone())
                .or_default()
                .insert(obj.path.clone());
        }
    }
}

/// Objects of one kind in one placement
pub struct Inventory {
    scope: Scope,
    kind: ObjectKind,
    inner: RwLock<InventoryInner>,
}

impl Inventory {
    /// Create an empty inventory
    pub fn new(scope: Scope, kind: ObjectKind) -> Self {
        Self {
            scope,
            kind,
            inner: RwLock::new(InventoryInner::default()),
        }
    }

    /// Placement served by this inventory
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Kind served by this inventory
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Insert or replace the object at its path
    pub fn upsert(&self, obj: BackendObject) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.objects.remove(&obj.path) {
            inner.unindex(&old);
        }
        inner.reindex(&obj);
        inner.objects.insert(obj.path.clone(), obj);
    }

    /// Drop the object at `path`
    pub fn remove(&self, path: &str) -> Option<BackendObject> {
        let mut inner = self.inner.write();
        let old = inner.objects.remove(path)?;
        inner.unindex(&old);
        Some(old)
    }

    /// Object at `path`
    pub fn get(&self, path: &str) -> Option<BackendObject> {
        self.inner.read().objects.get(path).cloned()
    }

    /// Objects tagged `scope=value`
    pub fn by_index(&self, scope: &str, value: &str) -> Vec<BackendObject> {
        let inner = self.inner.read();
        inner
            .index
            .get(scope)
            .and_then(|values| values.get(value))
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| inner.objects.get(p).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    /// Whether the inventory holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole content, e.g. after a reload from the backend
    pub fn replace_all(&self, objects: Vec<BackendObject>) {
        let mut inner = self.inner.write();
        *inner = InventoryInner::default();
        for obj in objects {
            inner.reindex(&obj);
            inner.objects.insert(obj.path.clone(), obj);
        }
    }
}

impl IndexedStore for Inventory {
    fn list_index_values(&self, scope: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .index
            .get(scope)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn list(&self) -> Vec<BackendObject> {
        self.inner.read().objects.values().cloned().collect()
    }
}

/// Every inventory, one per (placement, kind)
pub struct Inventories {
    stores: [[Arc<Inventory>; 4]; 3],
}

impl Default for Inventories {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventories {
    /// Empty inventories for every placement and kind
    pub fn new() -> Self {
        Self {
            stores: std::array::from_fn(|s| {
                std::array::from_fn(|k| Arc::new(Inventory::new(Scope::ALL[s], ObjectKind::ALL[k])))
            }),
        }
    }

    /// Inventory for one placement and kind
    pub fn get(&self, scope: Scope, kind: ObjectKind) -> Arc<Inventory> {
        Arc::clone(&self.stores[scope.index()][kind.index()])
    }

    /// Inventories of `kind` across all placements
    pub fn of_kind(&self, kind: ObjectKind) -> Vec<Arc<Inventory>> {
        Scope::ALL.iter().map(|scope| self.get(*scope, kind)).collect()
    }

    /// Inventory that should hold `obj`, by its path
    pub fn for_object(&self, obj: &BackendObject) -> crate::Result<Arc<Inventory>> {
        Ok(self.get(obj.scope()?, obj.kind()))
    }

    /// Every object tagged `scope=value` of `kind`, across placements
    pub fn by_index(&self, kind: ObjectKind, scope: &str, value: &str) -> Vec<BackendObject> {
        self.of_kind(kind)
            .iter()
            .flat_map(|store| store.by_index(scope, value))
            .collect()
    }
}
