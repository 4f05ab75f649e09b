use std::{
    collections::BTreeMap,
    marker::PhantomData,
    ops::Index,
};

/// Id-keyed storage that never reuses ids, so a stale id can be
/// detected instead of silently aliasing a newer entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Arena<Id: IdLike + Copy + Ord, T> {
    inner: BTreeMap<Id, T>,
    next_id: Id,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike + Copy + Ord, T> Arena<Id, T> {
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
            next_id: Id::from_raw(0),
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&mut self, x: T) -> Id {
        let id = self.next_id;
        self.next_id = Id::from_raw(self.next_id.into_raw() + 1);
        self.inner.insert(id, x);
        id
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        self.inner.remove(&id)
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.inner.get(&id)
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.inner.get_mut(&id)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.inner.contains_key(&id)
    }

    /// Entries in id (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.inner.iter().map(|(i, v)| (*i, v))
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.inner.keys().copied()
    }
}

impl<Id: IdLike + Copy + Ord, T> Default for Arena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdLike + Copy + Ord, T> Index<Id> for Arena<Id, T> {
    type Output = T;

    fn index(&self, index: Id) -> &Self::Output {
        &self.inner[&index]
    }
}

pub trait IdLike {
    fn from_raw(index: usize) -> Self;
    fn into_raw(self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Id(usize);

    impl IdLike for Id {
        fn from_raw(index: usize) -> Self {
            Self(index)
        }

        fn into_raw(self) -> usize {
            self.0
        }
    }

    #[test]
    fn ids_are_not_reused() {
        let mut arena: Arena<Id, &str> = Arena::new();
        let a = arena.push("a");
        let b = arena.push("b");
        assert_eq!(arena.remove(a), Some("a"));
        let c = arena.push("c");
        assert_ne!(a, c);
        assert!(!arena.contains(a));
        assert_eq!(arena.ids().collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(arena[c], "c");
    }
}
