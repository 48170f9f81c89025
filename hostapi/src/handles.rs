//! Handle table: a slab mapping small integers to host values.
//!
//! Guest code cannot hold host references, so every host value it needs to
//! name across more than one boundary call lives in a slot of this table.
//! Free slots form an intrusive free list: a free slot stores the index of
//! the next free slot, and the list head is `next_free`. Allocation pops the
//! head (growing by one slot when the list is empty) and release pushes the
//! slot back, so the table never grows past the high-water mark of
//! concurrently live handles.
//!
//! The first [`RESERVED_HANDLES`] slots are a static prefix of constants that
//! are never allocated, freed, or overwritten.

use std::fmt;

use crate::error::BridgeError;
use crate::types::HostValue;

/// Number of low handles that are permanently reserved.
pub const RESERVED_HANDLES: u32 = 36;

/// Default bound on the number of slots the table may grow to.
pub const DEFAULT_MAX_HANDLES: usize = 1 << 20;

/// An opaque index naming a slot in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl Handle {
    /// "No value" in nullable contexts.
    pub const NONE: Handle = Handle(0);
    pub const UNDEFINED: Handle = Handle(32);
    pub const NULL: Handle = Handle(33);
    pub const TRUE: Handle = Handle(34);
    pub const FALSE: Handle = Handle(35);

    pub fn is_reserved(self) -> bool {
        self.0 < RESERVED_HANDLES
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The reserved handle for a boolean.
    pub fn of_bool(b: bool) -> Handle {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Slot {
    Live(HostValue),
    Free { next: u32 },
}

/// Slab of host values addressed by [`Handle`].
pub struct HandleTable {
    slots: Vec<Slot>,
    next_free: u32,
    live: usize,
    max_slots: usize,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Create a table with the reserved constant prefix installed.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_HANDLES)
    }

    /// Create a table that refuses to grow past `max_slots` slots in total
    /// (reserved prefix included).
    pub fn with_limit(max_slots: usize) -> Self {
        let mut slots: Vec<Slot> = (0..32).map(|_| Slot::Live(HostValue::Undefined)).collect();
        slots.push(Slot::Live(HostValue::Undefined));
        slots.push(Slot::Live(HostValue::Null));
        slots.push(Slot::Live(HostValue::Bool(true)));
        slots.push(Slot::Live(HostValue::Bool(false)));
        debug_assert_eq!(slots.len(), RESERVED_HANDLES as usize);
        Self {
            slots,
            next_free: RESERVED_HANDLES,
            live: 0,
            max_slots: max_slots.max(RESERVED_HANDLES as usize),
        }
    }

    /// Install `value` in a free slot and return its handle.
    ///
    /// Reuses the most recently released slot; grows the table by one slot
    /// only when no slot is free.
    pub fn allocate(&mut self, value: HostValue) -> Result<Handle, BridgeError> {
        let len = self.slots.len() as u32;
        if self.next_free == len {
            if self.slots.len() >= self.max_slots {
                return Err(BridgeError::ResourceExhausted(format!(
                    "handle table is full ({} slots)",
                    self.max_slots
                )));
            }
            self.slots.push(Slot::Free { next: len + 1 });
        }
        let idx = self.next_free;
        let next = match self.slots[idx as usize] {
            Slot::Free { next } => next,
            Slot::Live(_) => {
                return Err(BridgeError::ResourceExhausted(format!(
                    "handle free list corrupted at slot {idx}"
                )))
            }
        };
        self.next_free = next;
        self.slots[idx as usize] = Slot::Live(value);
        self.live += 1;
        Ok(Handle(idx))
    }

    /// Borrow the value behind a live handle.
    pub fn get(&self, handle: Handle) -> Result<&HostValue, BridgeError> {
        self.get_for("get", handle)
    }

    /// Like [`get`](Self::get), naming `op` in the fault.
    pub fn get_for(&self, op: &'static str, handle: Handle) -> Result<&HostValue, BridgeError> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle {
                op,
                handle: handle.0,
            }),
        }
    }

    /// Read and release in one step (move semantics). Reserved handles are
    /// read but never released.
    pub fn take(&mut self, handle: Handle) -> Result<HostValue, BridgeError> {
        self.take_for("take", handle)
    }

    /// Like [`take`](Self::take), naming `op` in the fault.
    pub fn take_for(&mut self, op: &'static str, handle: Handle) -> Result<HostValue, BridgeError> {
        if handle.is_reserved() {
            return self.get_for(op, handle).cloned();
        }
        self.release(op, handle)
    }

    /// Release without reading. Dropping a reserved handle is a no-op.
    pub fn drop(&mut self, handle: Handle) -> Result<(), BridgeError> {
        if handle.is_reserved() {
            return Ok(());
        }
        self.release("drop", handle).map(|_| ())
    }

    /// Install a second handle naming the same host value.
    pub fn duplicate(&mut self, handle: Handle) -> Result<Handle, BridgeError> {
        let value = self.get_for("duplicate", handle)?.clone();
        self.allocate(value)
    }

    /// Number of live, non-reserved handles.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of non-reserved slots ever created.
    pub fn high_water(&self) -> usize {
        self.slots.len() - RESERVED_HANDLES as usize
    }

    /// True if `handle` currently names a value.
    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.0 as usize), Some(Slot::Live(_)))
    }

    fn release(&mut self, op: &'static str, handle: Handle) -> Result<HostValue, BridgeError> {
        let invalid = BridgeError::InvalidHandle {
            op,
            handle: handle.0,
        };
        let next = self.next_free;
        let slot = self
            .slots
            .get_mut(handle.0 as usize)
            .ok_or_else(|| invalid.clone())?;
        if let Slot::Free { .. } = slot {
            return Err(invalid);
        }
        let Slot::Live(value) = std::mem::replace(slot, Slot::Free { next }) else {
            return Err(invalid);
        };
        self.next_free = handle.0;
        self.live -= 1;
        Ok(value)
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.live)
            .field("high_water", &self.high_water())
            .field("next_free", &self.next_free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reserved_constants() {
        let table = HandleTable::new();
        assert_eq!(table.get(Handle::UNDEFINED).unwrap(), &HostValue::Undefined);
        assert_eq!(table.get(Handle::NULL).unwrap(), &HostValue::Null);
        assert_eq!(table.get(Handle::TRUE).unwrap(), &HostValue::Bool(true));
        assert_eq!(table.get(Handle::FALSE).unwrap(), &HostValue::Bool(false));
        assert_eq!(table.get(Handle::NONE).unwrap(), &HostValue::Undefined);
    }

    #[test]
    fn test_first_allocation_follows_reserved_prefix() {
        let mut table = HandleTable::new();
        let h = table.allocate(HostValue::Number(1.0)).unwrap();
        assert_eq!(h, Handle(RESERVED_HANDLES));
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_reserved_handles_survive_drop_and_take() {
        let mut table = HandleTable::new();
        table.drop(Handle::NULL).unwrap();
        assert_eq!(table.take(Handle::TRUE).unwrap(), HostValue::Bool(true));
        assert_eq!(table.get(Handle::NULL).unwrap(), &HostValue::Null);
        assert_eq!(table.get(Handle::TRUE).unwrap(), &HostValue::Bool(true));
        let h = table.allocate(HostValue::Null).unwrap();
        assert!(!h.is_reserved());
    }

    #[test]
    fn test_take_releases_slot() {
        let mut table = HandleTable::new();
        let h = table.allocate(HostValue::string("x")).unwrap();
        assert_eq!(table.take(h).unwrap(), HostValue::string("x"));
        assert!(!table.contains(h));
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_use_after_free_is_a_fault() {
        let mut table = HandleTable::new();
        let h = table.allocate(HostValue::Bool(true)).unwrap();
        table.drop(h).unwrap();
        assert_eq!(
            table.get(h).unwrap_err(),
            BridgeError::InvalidHandle { op: "get", handle: h.0 }
        );
        assert_eq!(
            table.drop(h).unwrap_err(),
            BridgeError::InvalidHandle { op: "drop", handle: h.0 }
        );
        assert!(table.take(Handle(9_999)).is_err());
    }

    #[test]
    fn test_freed_slot_reissued_without_aliasing() {
        let mut table = HandleTable::new();
        let h1 = table.allocate(HostValue::string("old")).unwrap();
        table.drop(h1).unwrap();
        let h2 = table.allocate(HostValue::string("new")).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(table.get(h2).unwrap(), &HostValue::string("new"));
    }

    #[test]
    fn test_duplicate_shares_value() {
        let mut table = HandleTable::new();
        let obj = HostValue::object();
        let h = table.allocate(obj.clone()).unwrap();
        let dup = table.duplicate(h).unwrap();
        assert_ne!(h, dup);
        table.drop(h).unwrap();
        assert_eq!(table.get(dup).unwrap(), &obj);
    }

    #[test]
    fn test_growth_limit_is_resource_exhaustion() {
        let mut table = HandleTable::with_limit(RESERVED_HANDLES as usize + 2);
        table.allocate(HostValue::Null).unwrap();
        let h = table.allocate(HostValue::Null).unwrap();
        let err = table.allocate(HostValue::Null).unwrap_err();
        assert!(matches!(err, BridgeError::ResourceExhausted(_)));
        table.drop(h).unwrap();
        table.allocate(HostValue::Null).unwrap();
    }

    #[test]
    fn test_end_to_end_duplicate_then_drop_original() {
        let mut table = HandleTable::new();
        let obj = HostValue::object();
        obj.set_property("a", HostValue::Number(1.0)).unwrap();
        let _h_obj = table.allocate(obj).unwrap();
        let h_str = table.allocate(HostValue::string("hello")).unwrap();
        let _h_bool = table.allocate(HostValue::Bool(true)).unwrap();

        let dup = table.duplicate(h_str).unwrap();
        table.drop(h_str).unwrap();
        assert_eq!(table.get(dup).unwrap(), &HostValue::string("hello"));

        let next = table.allocate(HostValue::Null).unwrap();
        assert_eq!(next, h_str);
    }

    proptest! {
        #[test]
        fn prop_take_allocate_round_trip(n in any::<f64>().prop_filter("not NaN", |n| !n.is_nan()), s in ".*") {
            let mut table = HandleTable::new();
            let hn = table.allocate(HostValue::Number(n)).unwrap();
            let hs = table.allocate(HostValue::string(&s)).unwrap();
            prop_assert_ne!(hn, hs);
            prop_assert_eq!(table.take(hs).unwrap(), HostValue::string(&s));
            prop_assert_eq!(table.take(hn).unwrap(), HostValue::Number(n));
        }

        #[test]
        fn prop_free_list_bounded_by_live_peak(ops in prop::collection::vec(any::<bool>(), 1..200)) {
            let mut table = HandleTable::new();
            let mut live: Vec<Handle> = Vec::new();
            let mut peak = 0usize;
            for (i, alloc) in ops.into_iter().enumerate() {
                if alloc || live.is_empty() {
                    let h = table.allocate(HostValue::Number(i as f64)).unwrap();
                    prop_assert!(!live.contains(&h));
                    live.push(h);
                } else {
                    let h = live.remove(i % live.len());
                    table.drop(h).unwrap();
                }
                peak = peak.max(live.len());
                prop_assert_eq!(table.live(), live.len());
                prop_assert!(table.high_water() <= peak);
            }
        }
    }
}
