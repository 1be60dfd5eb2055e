//! Structural equality with skippable fields
//!
//! `DeepEq` walks two values of the same type and compares them field by
//! field. Unlike `PartialEq`, struct impls generated by [`deep_eq_struct!`]
//! can mark fields as skipped, which the config poller relies on so that
//! volatile data (live backend maps) does not look like a configuration
//! change.
//!
//! Shared pointers are tracked in a [`Visited`] set keyed by both addresses
//! and the pointee type, so graphs with shared or cyclic substructure
//! terminate.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;

/// Pointer pairs already under comparison
#[derive(Debug, Default)]
pub struct Visited {
    seen: HashSet<(usize, usize, TypeId)>,
}

impl Visited {
    /// Records the pair and returns `true` if it was already present.
    pub fn check_and_insert<T: ?Sized + 'static>(&mut self, a: *const T, b: *const T) -> bool {
        let key = (a as *const () as usize, b as *const () as usize, TypeId::of::<T>());
        !self.seen.insert(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

pub trait DeepEq {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool;

    fn deep_eq(&self, other: &Self) -> bool {
        self.deep_eq_with(other, &mut Visited::default())
    }
}

/// Implements `DeepEq` by delegating to `PartialEq`.
#[macro_export]
macro_rules! deep_eq_via_partial_eq {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::deep_eq::DeepEq for $ty {
                fn deep_eq_with(&self, other: &Self, _visited: &mut $crate::deep_eq::Visited) -> bool {
                    self == other
                }
            }
        )*
    };
}

/// Implements `DeepEq` for a struct, comparing the listed fields and
/// ignoring those in the `skip` list.
///
/// Every field of the struct must appear in one of the two lists; the
/// generated code destructures `self` exhaustively so a new field that is
/// not listed fails to compile.
///
/// ```ignore
/// deep_eq_struct!(HAProxyEndpoint { name, section, per_server } skip { backend_servers });
/// ```
#[macro_export]
macro_rules! deep_eq_struct {
    ($name:ident { $($field:ident),* $(,)? } $(skip { $($skipped:ident),* $(,)? })?) => {
        impl $crate::deep_eq::DeepEq for $name {
            fn deep_eq_with(&self, other: &Self, visited: &mut $crate::deep_eq::Visited) -> bool {
                let $name { $($field,)* $($($skipped: _,)*)? } = self;
                $(
                    if !$crate::deep_eq::DeepEq::deep_eq_with($field, &other.$field, visited) {
                        return false;
                    }
                )*
                true
            }
        }
    };
}

deep_eq_via_partial_eq!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    str,
    serde_json::Value,
    chrono::DateTime<chrono::Utc>,
    std::time::Duration,
);

// None and Some(empty) are different values.
impl<T: DeepEq> DeepEq for Option<T> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.deep_eq_with(b, visited),
            _ => false,
        }
    }
}

impl<T: DeepEq> DeepEq for [T] {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.deep_eq_with(b, visited))
    }
}

impl<T: DeepEq, const N: usize> DeepEq for [T; N] {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        self.as_slice().deep_eq_with(other.as_slice(), visited)
    }
}

impl<T: DeepEq> DeepEq for Vec<T> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        self.as_slice().deep_eq_with(other.as_slice(), visited)
    }
}

impl<K: Ord, V: DeepEq> DeepEq for BTreeMap<K, V> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        self.len() == other.len()
            && self.iter().all(|(k, a)| match other.get(k) {
                Some(b) => a.deep_eq_with(b, visited),
                None => false,
            })
    }
}

impl<K: Eq + Hash, V: DeepEq, S: std::hash::BuildHasher> DeepEq for HashMap<K, V, S> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        self.len() == other.len()
            && self.iter().all(|(k, a)| match other.get(k) {
                Some(b) => a.deep_eq_with(b, visited),
                None => false,
            })
    }
}

impl<T: DeepEq + ?Sized> DeepEq for Box<T> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        (**self).deep_eq_with(&**other, visited)
    }
}

impl<T: DeepEq + ?Sized + 'static> DeepEq for Arc<T> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        if visited.check_and_insert::<T>(Arc::as_ptr(self), Arc::as_ptr(other)) {
            return true;
        }
        (**self).deep_eq_with(&**other, visited)
    }
}

impl<T: DeepEq + ?Sized + 'static> DeepEq for Rc<T> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        if Rc::ptr_eq(self, other) {
            return true;
        }
        if visited.check_and_insert::<T>(Rc::as_ptr(self), Rc::as_ptr(other)) {
            return true;
        }
        (**self).deep_eq_with(&**other, visited)
    }
}

impl<T: DeepEq> DeepEq for RefCell<T> {
    fn deep_eq_with(&self, other: &Self, visited: &mut Visited) -> bool {
        match (self.try_borrow(), other.try_borrow()) {
            (Ok(a), Ok(b)) => a.deep_eq_with(&b, visited),
            _ => false,
        }
    }
}

// Function values are only equal when both are absent, which the `Option`
// impl handles; two present functions never compare equal.
impl<R> DeepEq for fn() -> R {
    fn deep_eq_with(&self, _other: &Self, _visited: &mut Visited) -> bool {
        false
    }
}

impl<A, R> DeepEq for fn(A) -> R {
    fn deep_eq_with(&self, _other: &Self, _visited: &mut Visited) -> bool {
        false
    }
}
