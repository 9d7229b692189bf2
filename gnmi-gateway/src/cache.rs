//! Latest-value telemetry cache.
//!
//! Every target owns a tree of [`Leaf`] values keyed by structured path,
//! guarded by its own lock: updates to one target never wait on reads of
//! another, while operations on the same target are serialized. Each update
//! or delete applied to a tree is handed to the [`Matcher`] while the
//! target's lock is still held, so live subscribers observe a target's
//! changes in the order they were applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

use crate::gnmi::{self, Encoding, Notification, TypedValue, typed_value};
use crate::matcher::Matcher;
use crate::path::{self, Elem, WILDCARD};

/// Errors returned by [`Cache`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Notification prefix carries no target")]
    MissingTarget,
}

/// Value carried by a [`Leaf`].
#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Update(TypedValue),
    Delete,
}

/// Latest known value at one fully-qualified path of a target.
#[derive(Debug)]
pub struct Leaf {
    target: String,
    origin: String,
    path: Vec<Elem>,
    key: String,
    timestamp: i64,
    value: LeafValue,
}

impl Leaf {
    pub fn new(
        target: impl Into<String>,
        origin: impl Into<String>,
        path: Vec<Elem>,
        timestamp: i64,
        value: LeafValue,
    ) -> Self {
        let target = target.into();
        let key = format!("{}{}", target, path::to_string(&path));
        Self {
            target,
            origin: origin.into(),
            path,
            key,
            timestamp,
            value,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn path(&self) -> &[Elem] {
        &self.path
    }

    /// Target plus rendered path; unique per stored leaf.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn value(&self) -> &LeafValue {
        &self.value
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.value, LeafValue::Delete)
    }

    /// Detached copy recording the removal of this leaf.
    fn deleted(&self, timestamp: i64) -> Self {
        Self {
            target: self.target.clone(),
            origin: self.origin.clone(),
            path: self.path.clone(),
            key: self.key.clone(),
            timestamp,
            value: LeafValue::Delete,
        }
    }

    /// Wire notification for this leaf, target and origin in the prefix.
    pub fn to_notification(&self, duplicates: u32) -> Notification {
        let prefix = gnmi::Path {
            target: self.target.clone(),
            origin: self.origin.clone(),
            ..Default::default()
        };

        match &self.value {
            LeafValue::Update(val) => Notification {
                timestamp: self.timestamp,
                prefix: Some(prefix),
                update: vec![gnmi::Update {
                    path: Some(path::to_proto(&self.path)),
                    val: Some(val.clone()),
                    duplicates,
                    ..Default::default()
                }],
                ..Default::default()
            },
            LeafValue::Delete => Notification {
                timestamp: self.timestamp,
                prefix: Some(prefix),
                delete: vec![path::to_proto(&self.path)],
                ..Default::default()
            },
        }
    }
}

/// One node of a target tree.
#[derive(Debug, Default)]
struct Branch {
    leaf: Option<Arc<Leaf>>,
    children: BTreeMap<Elem, Branch>,
}

impl Branch {
    fn get(&self, path: &[Elem]) -> Option<&Arc<Leaf>> {
        match path.split_first() {
            None => self.leaf.as_ref(),
            Some((head, rest)) => self.children.get(head)?.get(rest),
        }
    }

    fn insert(&mut self, path: &[Elem], leaf: Arc<Leaf>) {
        let mut node = self;
        for elem in path {
            node = node.children.entry(elem.clone()).or_default();
        }
        node.leaf = Some(leaf);
    }

    fn is_empty(&self) -> bool {
        self.leaf.is_none() && self.children.is_empty()
    }

    fn walk<F: FnMut(&Arc<Leaf>)>(&self, visit: &mut F) {
        if let Some(leaf) = &self.leaf {
            visit(leaf);
        }
        for child in self.children.values() {
            child.walk(visit);
        }
    }

    /// Children selected by a pattern elem.
    fn matching(&self, pattern: &Elem) -> Vec<Elem> {
        if pattern.name == WILDCARD {
            return self
                .children
                .keys()
                .filter(|elem| pattern.keys_match(&elem.keys))
                .cloned()
                .collect();
        }

        // Keyless elems sort first among those sharing a name
        self.children
            .range(Elem::new(pattern.name.clone())..)
            .take_while(|(elem, _)| elem.name == pattern.name)
            .filter(|(elem, _)| pattern.keys_match(&elem.keys))
            .map(|(elem, _)| elem.clone())
            .collect()
    }

    fn visit_matching<F: FnMut(&Arc<Leaf>)>(&self, pattern: &[Elem], visit: &mut F) {
        let Some((head, rest)) = pattern.split_first() else {
            self.walk(visit);
            return;
        };

        for elem in self.matching(head) {
            if let Some(child) = self.children.get(&elem) {
                child.visit_matching(rest, visit);
            }
        }
    }

    fn remove_matching(&mut self, pattern: &[Elem], removed: &mut Vec<Arc<Leaf>>) {
        let Some((head, rest)) = pattern.split_first() else {
            std::mem::take(self).walk(&mut |leaf| removed.push(leaf.clone()));
            return;
        };

        for elem in self.matching(head) {
            if let Some(child) = self.children.get_mut(&elem) {
                child.remove_matching(rest, removed);
                if child.is_empty() {
                    self.children.remove(&elem);
                }
            }
        }
    }
}

/// Shared store of the latest value at every leaf of every target.
#[derive(Debug)]
pub struct Cache {
    targets: RwLock<HashMap<String, Arc<Mutex<Branch>>>>,
    matcher: Arc<Matcher>,
}

impl Cache {
    /// Create an empty cache feeding live changes to `matcher`.
    pub fn new(matcher: Arc<Matcher>) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            matcher,
        }
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    /// Register a target. Adding a known target keeps its values.
    pub fn add_target(&self, name: &str) {
        self.targets
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(target_name = %name, "Adding target to cache");
                Arc::new(Mutex::new(Branch::default()))
            });
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.targets.read().contains_key(name)
    }

    /// Drop a target and every value stored for it.
    pub fn remove_target(&self, name: &str) -> bool {
        let removed = self.targets.write().remove(name).is_some();
        if removed {
            debug!(target_name = %name, "Removed target from cache");
        }
        removed
    }

    /// Known target names, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn tree(&self, name: &str) -> Result<Arc<Mutex<Branch>>, CacheError> {
        self.targets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownTarget(name.to_string()))
    }

    /// Latest value stored at an exact path.
    pub fn get(&self, target: &str, path: &[Elem]) -> Option<Arc<Leaf>> {
        self.tree(target).ok()?.lock().get(path).cloned()
    }

    /// Apply a notification's deletes, then its updates, to the target named
    /// in its prefix. Returns the number of leaves touched.
    pub fn update(&self, notification: &Notification) -> Result<usize, CacheError> {
        let prefix = notification.prefix.as_ref();
        let target = prefix.map(|p| p.target.as_str()).unwrap_or_default();
        if target.is_empty() {
            return Err(CacheError::MissingTarget);
        }
        let origin = prefix.map(|p| p.origin.as_str()).unwrap_or_default();
        let timestamp = if notification.timestamp > 0 {
            notification.timestamp
        } else {
            crate::timestamp_nanos()
        };

        let tree = self.tree(target)?;
        let mut tree = tree.lock();
        let mut touched = 0;

        for delete in &notification.delete {
            let pattern = path::join(prefix, Some(delete));
            let mut removed = Vec::new();
            tree.remove_matching(&pattern, &mut removed);

            for leaf in removed {
                let gone = Arc::new(leaf.deleted(timestamp));
                self.matcher.notify(&gone);
                touched += 1;
            }
        }

        for update in &notification.update {
            let path = path::join(prefix, update.path.as_ref());

            if let Some(existing) = tree.get(&path) {
                if existing.timestamp > timestamp {
                    debug!(
                        target_name = %target,
                        path = %path::to_string(&path),
                        "Skipping stale update"
                    );
                    continue;
                }
            }

            let value = match &update.val {
                Some(val) => val.clone(),
                None => legacy_value(update),
            };
            let leaf = Arc::new(Leaf::new(
                target,
                origin,
                path.clone(),
                timestamp,
                LeafValue::Update(value),
            ));
            tree.insert(&path, leaf.clone());
            self.matcher.notify(&leaf);
            touched += 1;
        }

        trace!(target_name = %target, touched, "Applied notification");
        Ok(touched)
    }

    /// Visit every leaf of `target` under a path pattern.
    ///
    /// An empty or `*` target visits all targets. Leaves are visited in
    /// unspecified order while the target's lock is held: `visit` must not
    /// block or call back into the cache.
    pub fn query<F>(&self, target: &str, pattern: &[Elem], mut visit: F) -> Result<(), CacheError>
    where
        F: FnMut(&Arc<Leaf>),
    {
        let trees: Vec<Arc<Mutex<Branch>>> = if target.is_empty() || target == WILDCARD {
            self.targets.read().values().cloned().collect()
        } else {
            vec![self.tree(target)?]
        };

        for tree in trees {
            tree.lock().visit_matching(pattern, &mut visit);
        }
        Ok(())
    }
}

// Value carried in the deprecated `Update.value` field.
fn legacy_value(update: &gnmi::Update) -> TypedValue {
    #[allow(deprecated)]
    let legacy = update.value.as_ref();
    let Some(legacy) = legacy else {
        return TypedValue::default();
    };

    let value = match Encoding::try_from(legacy.r#type) {
        Ok(Encoding::Json) => typed_value::Value::JsonVal(legacy.value.clone()),
        Ok(Encoding::JsonIetf) => typed_value::Value::JsonIetfVal(legacy.value.clone()),
        Ok(Encoding::Ascii) => {
            typed_value::Value::AsciiVal(String::from_utf8_lossy(&legacy.value).to_string())
        }
        Ok(Encoding::Proto) => typed_value::Value::ProtoBytes(legacy.value.clone()),
        _ => typed_value::Value::BytesVal(legacy.value.clone()),
    };
    TypedValue { value: Some(value) }
}
