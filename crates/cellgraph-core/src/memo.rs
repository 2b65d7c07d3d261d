//! # Memoization Store
//!
//! Address -> last computed cell. Owned by a `Context`; there is no global
//! instance. Entries only change on save, explicit eviction or `clear`.
//! No automatic eviction: an entry is as fresh as its last save.

use crate::address::Address;
use crate::cell::Cell;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct MemoStore {
    cells: BTreeMap<Address, Cell>,
}

impl MemoStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous entry.
    pub fn insert(&mut self, address: Address, cell: Cell) -> Option<Cell> {
        self.cells.insert(address, cell)
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&Cell> {
        self.cells.get(address)
    }

    /// Remove an entry so the next load goes back to persistence.
    pub fn evict(&mut self, address: &Address) -> Option<Cell> {
        self.cells.remove(address)
    }

    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.cells.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> + '_ {
        self.cells.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn insert_get_evict() {
        let mut memo = MemoStore::new();
        let cell = Cell::literal(3).with_extra("key", "a").with_primary_key(["key"]);
        let address = cell.address().expect("resolve").expect("address");

        assert!(memo.insert(address.clone(), cell).is_none());
        assert_eq!(
            memo.get(&address).map(|c| c.value().expect("value")),
            Some(Value::Int(3))
        );

        assert!(memo.evict(&address).is_some());
        assert!(!memo.contains(&address));
        assert!(memo.evict(&address).is_none());
    }

    #[test]
    fn insert_replaces_previous_entry() {
        let mut memo = MemoStore::new();
        let first = Cell::literal(1).with_extra("key", "a").with_primary_key(["key"]);
        let second = Cell::literal(2).with_extra("key", "a").with_primary_key(["key"]);
        let address = first.address().expect("resolve").expect("address");

        memo.insert(address.clone(), first);
        let previous = memo.insert(address.clone(), second).expect("previous");
        assert_eq!(previous.value().expect("value"), Value::Int(1));
        assert_eq!(memo.len(), 1);
    }
}
