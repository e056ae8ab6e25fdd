//! Request-scoped storage.
//!
//! [`RequestItems`] is a small type-erased bag owned by one
//! [`HttpContext`](crate::HttpContext). Middleware use it to hand state from
//! the "before" phase of a request to its "after" phase. Values are keyed by
//! well-known string names and checked against their type on retrieval.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Key under which the in-flight [`AuditAction`](crate::AuditAction) is stored
pub const AUDIT_ACTION_KEY: &str = "__private_AuditApiAction__";

/// Key under which the open [`AuditScope`](crate::AuditScope) is stored
pub const AUDIT_SCOPE_KEY: &str = "__private_AuditApiScope__";

/// Per-request key/value storage
#[derive(Default)]
pub struct RequestItems {
    map: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl RequestItems {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value, replacing whatever was stored under `key`.
    pub fn insert<T: Send + Sync + 'static>(&mut self, key: &'static str, value: T) {
        self.map.insert(key, Box::new(value));
    }

    /// Get a value by key.
    ///
    /// Returns `None` when the key is missing or holds a different type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<&T> {
        self.map.get(key).and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.map.get_mut(key).and_then(|value| value.downcast_mut())
    }

    /// Remove and return a value.
    ///
    /// A value of the wrong type is left in place.
    pub fn remove<T: Send + Sync + 'static>(&mut self, key: &str) -> Option<T> {
        if !self.map.get(key).is_some_and(|value| value.is::<T>()) {
            return None;
        }
        self.map
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for RequestItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}
