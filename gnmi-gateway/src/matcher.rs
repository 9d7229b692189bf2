//! Path-pattern index routing live cache changes to subscriptions.
//!
//! Patterns are registered as elem sequences whose first elem names the
//! target (`*` for every target). A pattern selects a leaf when each of its
//! elems matches the leaf's elem at the same depth; deeper leaves under a
//! matched pattern are selected too. The index is a trie keyed by elem name,
//! each name holding one child per distinct key constraint set.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::cache::{Leaf, LeafValue};
use crate::gnmi::Notification;
use crate::path::{self, Elem, WILDCARD};

/// Callback invoked once per matched leaf.
pub type Callback = Arc<dyn Fn(&Arc<Leaf>) + Send + Sync>;

#[derive(Default)]
struct Node {
    queries: HashMap<u64, Callback>,
    children: HashMap<String, Vec<Keyed>>,
}

struct Keyed {
    keys: BTreeMap<String, String>,
    node: Node,
}

impl Node {
    fn child_mut(&mut self, elem: &Elem) -> &mut Node {
        let keyed = self.children.entry(elem.name.clone()).or_default();
        let pos = match keyed.iter().position(|k| k.keys == elem.keys) {
            Some(pos) => pos,
            None => {
                keyed.push(Keyed {
                    keys: elem.keys.clone(),
                    node: Node::default(),
                });
                keyed.len() - 1
            }
        };
        &mut keyed[pos].node
    }

    fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.children.is_empty()
    }

    fn collect(&self, path: &[Elem], out: &mut Vec<Callback>) {
        out.extend(self.queries.values().cloned());

        let Some((head, rest)) = path.split_first() else {
            return;
        };

        for name in [head.name.as_str(), WILDCARD] {
            let Some(keyed) = self.children.get(name) else {
                continue;
            };
            for child in keyed {
                let pattern_keys_match = child.keys.iter().all(|(k, v)| head.keys.get(k) == Some(v));
                if pattern_keys_match {
                    child.node.collect(rest, out);
                }
            }
            if head.name == WILDCARD {
                break;
            }
        }
    }

    // Returns true when the registration was found and removed.
    fn remove(&mut self, pattern: &[Elem], id: u64) -> bool {
        let Some((head, rest)) = pattern.split_first() else {
            return self.queries.remove(&id).is_some();
        };

        let Some(keyed) = self.children.get_mut(&head.name) else {
            return false;
        };
        let Some(pos) = keyed.iter().position(|k| k.keys == head.keys) else {
            return false;
        };

        let removed = keyed[pos].node.remove(rest, id);
        if keyed[pos].node.is_empty() {
            keyed.swap_remove(pos);
        }
        if keyed.is_empty() {
            self.children.remove(&head.name);
        }
        removed
    }

    fn count(&self) -> usize {
        self.queries.len()
            + self
                .children
                .values()
                .flatten()
                .map(|k| k.node.count())
                .sum::<usize>()
    }
}

/// Trie of registered path patterns.
pub struct Matcher {
    root: RwLock<Node>,
    next_id: AtomicU64,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("queries", &self.len())
            .finish()
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for leaves selected by `pattern`.
    ///
    /// The registration lives until the returned handle is removed or
    /// dropped. Keys valued `*` are treated as absent.
    pub fn add_query(self: &Arc<Self>, pattern: Vec<Elem>, callback: Callback) -> QueryHandle {
        let pattern: Vec<Elem> = pattern.iter().map(Elem::normalized).collect();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut root = self.root.write();
            let mut node = &mut *root;
            for elem in &pattern {
                node = node.child_mut(elem);
            }
            node.queries.insert(id, callback);
        }

        QueryHandle {
            matcher: Arc::clone(self),
            pattern,
            id,
        }
    }

    /// Invoke every callback whose pattern selects `leaf`, once each.
    ///
    /// Callbacks run after the index lock is released.
    pub fn notify(&self, leaf: &Arc<Leaf>) {
        let mut path = Vec::with_capacity(leaf.path().len() + 1);
        path.push(Elem::new(leaf.target()));
        path.extend_from_slice(leaf.path());

        let mut matched = Vec::new();
        self.root.read().collect(&path, &mut matched);

        for callback in matched {
            callback(leaf);
        }
    }

    /// Notify every leaf a notification touches: each delete path, then
    /// each update path. Returns the number of touches.
    ///
    /// For notifications that do not go through the [`Cache`](crate::Cache),
    /// which notifies per stored leaf on its own.
    pub fn update(&self, notification: &Notification) -> usize {
        let Some(prefix) = notification.prefix.as_ref().filter(|p| !p.target.is_empty()) else {
            return 0;
        };
        let touch = |path, value| {
            Arc::new(Leaf::new(
                prefix.target.as_str(),
                prefix.origin.as_str(),
                path,
                notification.timestamp,
                value,
            ))
        };

        let mut touched = 0;
        for delete in &notification.delete {
            self.notify(&touch(path::join(Some(prefix), Some(delete)), LeafValue::Delete));
            touched += 1;
        }
        for update in &notification.update {
            let value = LeafValue::Update(update.val.clone().unwrap_or_default());
            self.notify(&touch(path::join(Some(prefix), update.path.as_ref()), value));
            touched += 1;
        }
        touched
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.root.read().count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }

    fn remove(&self, pattern: &[Elem], id: u64) {
        self.root.write().remove(pattern, id);
    }
}

/// Live registration in a [`Matcher`]; removing or dropping it unregisters.
pub struct QueryHandle {
    matcher: Arc<Matcher>,
    pattern: Vec<Elem>,
    id: u64,
}

impl QueryHandle {
    /// Unregister now.
    pub fn remove(self) {}
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.matcher.remove(&self.pattern, self.id);
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("pattern", &crate::path::to_string(&self.pattern))
            .finish()
    }
}
