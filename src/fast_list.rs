//! An unsynchronized, array-backed list with O(1) append/pop and
//! identity-based removal.
//!
//! Not shared across threads: each borrowing call site (or, for the bag's
//! per-thread cache, each thread) owns its own `FastList`.

/// A small append/pop-last vector with `removeByIdentity` semantics: entries
/// are compared by reference identity (pointer equality via [`PartialEq`]
/// on `Arc`/`Rc`-like handles), not by value.
#[derive(Debug, Default)]
pub struct FastList<T> {
    items: Vec<T>,
}

impl<T> FastList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append an item. O(1) amortized.
    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    /// Remove and return the last item, if any. O(1).
    pub fn remove_last(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate from most-recently-added to least-recently-added.
    pub fn iter_rev(&self) -> impl Iterator<Item = &T> {
        self.items.iter().rev()
    }
}

impl<T> FastList<std::sync::Arc<T>> {
    /// Remove the first element identity-equal (same `Arc` allocation) to
    /// `target`, preserving the order of the remaining elements. Returns
    /// whether an element was removed.
    ///
    /// This is `removeByIdentity`: two `Arc<T>`s that happen to point at
    /// equal *values* but different allocations do not match.
    pub fn remove_by_identity(&mut self, target: &std::sync::Arc<T>) -> bool {
        if let Some(pos) = self
            .items
            .iter()
            .position(|item| std::sync::Arc::ptr_eq(item, target))
        {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_and_remove_last_is_lifo() {
        let mut list = FastList::new();
        list.add(1);
        list.add(2);
        list.add(3);
        assert_eq!(list.remove_last(), Some(3));
        assert_eq!(list.remove_last(), Some(2));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_by_identity_preserves_order_and_uses_pointer_equality() {
        let a = Arc::new(1);
        let b = Arc::new(2);
        let c = Arc::new(3);

        let mut list = FastList::new();
        list.add(a.clone());
        list.add(b.clone());
        list.add(c.clone());

        assert!(list.remove_by_identity(&b));
        let remaining: Vec<_> = list.iter_rev().rev().map(|a| **a).collect();
        assert_eq!(remaining, vec![1, 3]);
        assert_eq!(list.len(), 2);

        // A different Arc with the same pointee value is not the same
        // identity and must not match.
        let a_copy = Arc::new(1);
        assert!(!list.remove_by_identity(&a_copy));
        assert_eq!(list.len(), 2);
    }
}
