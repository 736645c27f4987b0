//! Request-scoped side channel.
//!
//! Middleware, the lifecycle driver, and status handlers talk to each other
//! through [`Extensions`] stored on every [`Request`](crate::Request): the body
//! parser leaves a [`BodyError`](crate::lifecycle::BodyError), the validation
//! gate leaves [`ValidationErrors`](crate::validation::ValidationErrors), the
//! recovery guard leaves a [`Recovered`](crate::middleware::Recovered) panic, and
//! authentication middleware can leave its principal. Entries are keyed by type,
//! so each producer owns a distinct marker type and consumers never downcast
//! a stringly-typed value.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Type-keyed map of per-request values.
///
/// # Examples
///
/// ```
/// use trellis::context::Extensions;
///
/// #[derive(Debug, PartialEq)]
/// struct UserId(u64);
///
/// let mut extra = Extensions::new();
/// extra.insert(UserId(7));
/// assert_eq!(extra.get::<UserId>(), Some(&UserId(7)));
/// assert_eq!(extra.remove::<UserId>(), Some(UserId(7)));
/// assert!(extra.is_empty());
/// ```
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every entry. Required before reusing a pooled request.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(&'static str);

    #[test]
    fn insert_returns_previous_value() {
        let mut extra = Extensions::new();
        assert_eq!(extra.insert(Marker("a")), None);
        assert_eq!(extra.insert(Marker("b")), Some(Marker("a")));
        assert_eq!(extra.get::<Marker>(), Some(&Marker("b")));
    }

    #[test]
    fn distinct_types_do_not_collide() {
        let mut extra = Extensions::new();
        extra.insert(Marker("x"));
        extra.insert(42u32);
        assert_eq!(extra.len(), 2);
        assert_eq!(extra.get::<u32>(), Some(&42));
        assert!(extra.get::<u64>().is_none());
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut extra = Extensions::new();
        extra.insert(1u8);
        if let Some(v) = extra.get_mut::<u8>() {
            *v += 1;
        }
        assert_eq!(extra.get::<u8>(), Some(&2));
    }

    #[test]
    fn clear_empties_the_bag() {
        let mut extra = Extensions::new();
        extra.insert(Marker("stale"));
        extra.clear();
        assert!(!extra.contains::<Marker>());
    }
}
