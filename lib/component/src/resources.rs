//! Resource handle tables.
//!
//! Resources are opaque host-side values the guest refers to through
//! 32-bit handles. Each resource type owns a [`ResourceTable`] of
//! entries carrying the representation, a reference count and a lend
//! (borrow) count, plus a free-list so dropped slots are reused. A
//! [`ResourceStore`] keys tables by resource type id and lives inside a
//! single instance; handles never travel between instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{ComponentError, Error, ErrorKind, Phase};

/// A 32-bit resource handle, valid only within the table that issued
/// it.
pub type Handle = u32;

/// A destructor invoked with the representation of a resource when its
/// final handle is dropped.
pub type Destructor = Arc<dyn Fn(u32) -> Result<(), Error> + Send + Sync>;

fn handle_error(kind: ErrorKind, handle: Handle, what: &str) -> Error {
    ComponentError::new(Phase::Runtime, kind, format!("handle {handle}: {what}")).into()
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    rep: u32,
    ref_count: i32,
    lend_count: i32,
}

/// The handle table of one resource type.
#[derive(Default)]
pub struct ResourceTable {
    entries: Vec<Slot>,
    free: Vec<u32>,
    destructor: Option<Destructor>,
}

impl fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("entries", &self.entries.len())
            .field("free", &self.free.len())
            .field("has_destructor", &self.destructor.is_some())
            .finish()
    }
}

impl ResourceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn live_slot(&self, handle: Handle) -> Option<&Slot> {
        self.entries
            .get(handle as usize)
            .filter(|s| s.ref_count > 0)
    }

    /// Allocates a handle for `rep` with a reference count of one.
    /// Free-listed slots are reused before the table grows.
    pub fn new_handle(&mut self, rep: u32) -> Handle {
        let slot = Slot {
            rep,
            ref_count: 1,
            lend_count: 0,
        };
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx as usize] = slot;
                idx
            }
            None => {
                self.entries.push(slot);
                (self.entries.len() - 1) as u32
            }
        }
    }

    /// The representation behind a live handle.
    pub fn rep(&self, handle: Handle) -> Option<u32> {
        self.live_slot(handle).map(|s| s.rep)
    }

    /// Whether the handle is live.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.live_slot(handle).is_some()
    }

    /// Drops one reference.
    ///
    /// Fails if the handle is lent out (`lend_count > 0`) or already
    /// dropped. When the reference count reaches zero the slot goes to
    /// the free-list and the returned flag says whether the configured
    /// destructor must run for the returned representation. Destructors
    /// never run implicitly.
    pub fn drop_handle(&mut self, handle: Handle) -> Result<(u32, bool), Error> {
        let slot = match self.entries.get_mut(handle as usize) {
            Some(s) if s.ref_count > 0 => s,
            _ => return Err(handle_error(ErrorKind::InvalidInput, handle, "already dropped")),
        };
        if slot.lend_count > 0 {
            return Err(handle_error(
                ErrorKind::InvalidInput,
                handle,
                "cannot drop while lent out",
            ));
        }
        slot.ref_count -= 1;
        let rep = slot.rep;
        if slot.ref_count == 0 {
            self.free.push(handle);
            Ok((rep, self.destructor.is_some()))
        } else {
            Ok((rep, false))
        }
    }

    /// Marks the handle as lent out.
    pub fn borrow(&mut self, handle: Handle) -> Result<u32, Error> {
        match self.entries.get_mut(handle as usize) {
            Some(s) if s.ref_count > 0 => {
                s.lend_count += 1;
                Ok(s.rep)
            }
            _ => Err(handle_error(ErrorKind::InvalidInput, handle, "not live")),
        }
    }

    /// Ends one active borrow.
    pub fn end_borrow(&mut self, handle: Handle) -> Result<(), Error> {
        match self.entries.get_mut(handle as usize) {
            Some(s) if s.ref_count > 0 && s.lend_count > 0 => {
                s.lend_count -= 1;
                Ok(())
            }
            Some(s) if s.ref_count > 0 => {
                Err(handle_error(ErrorKind::InvalidInput, handle, "no active borrow"))
            }
            _ => Err(handle_error(ErrorKind::InvalidInput, handle, "not live")),
        }
    }

    /// Adds one reference to a live handle.
    pub fn clone_handle(&mut self, handle: Handle) -> Result<(), Error> {
        match self.entries.get_mut(handle as usize) {
            Some(s) if s.ref_count > 0 => {
                s.ref_count += 1;
                Ok(())
            }
            _ => Err(handle_error(ErrorKind::InvalidInput, handle, "already dropped")),
        }
    }

    /// Removes a live handle without running its destructor, returning
    /// the representation. This is the ownership-transfer primitive
    /// behind `lift-own`.
    pub fn take(&mut self, handle: Handle) -> Result<u32, Error> {
        let slot = match self.entries.get_mut(handle as usize) {
            Some(s) if s.ref_count > 0 => s,
            _ => return Err(handle_error(ErrorKind::InvalidInput, handle, "already dropped")),
        };
        if slot.lend_count > 0 {
            return Err(handle_error(
                ErrorKind::InvalidInput,
                handle,
                "cannot transfer while lent out",
            ));
        }
        slot.ref_count = 0;
        self.free.push(handle);
        Ok(slot.rep)
    }

    /// Attaches the destructor if the table does not have one yet.
    pub fn set_destructor(&mut self, destructor: Destructor) {
        self.destructor.get_or_insert(destructor);
    }

    /// Runs the configured destructor for a representation.
    pub fn run_destructor(&self, rep: u32) -> Result<(), Error> {
        match &self.destructor {
            Some(d) => d(rep),
            None => Ok(()),
        }
    }
}

/// All resource tables of one instance, keyed by resource type id.
/// Tables are created lazily on first touch.
#[derive(Debug, Default)]
pub struct ResourceStore {
    tables: HashMap<u32, ResourceTable>,
}

impl ResourceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table of a resource type, created if absent.
    pub fn table(&mut self, ty: u32) -> &mut ResourceTable {
        self.tables.entry(ty).or_default()
    }

    fn existing(&self, ty: u32, handle: Handle) -> Result<&ResourceTable, Error> {
        self.tables.get(&ty).ok_or_else(|| {
            ComponentError::new(
                Phase::Runtime,
                ErrorKind::InvalidInput,
                format!("handle {handle}: no resources of type {ty}"),
            )
            .into()
        })
    }

    fn existing_mut(&mut self, ty: u32, handle: Handle) -> Result<&mut ResourceTable, Error> {
        self.tables.get_mut(&ty).ok_or_else(|| {
            ComponentError::new(
                Phase::Runtime,
                ErrorKind::InvalidInput,
                format!("handle {handle}: no resources of type {ty}"),
            )
            .into()
        })
    }

    /// Guest-side `resource.new`: wraps a representation in a fresh
    /// owned handle.
    pub fn resource_new(&mut self, ty: u32, rep: u32) -> Handle {
        self.table(ty).new_handle(rep)
    }

    /// Guest-side `resource.rep`.
    pub fn resource_rep(&self, ty: u32, handle: Handle) -> Result<u32, Error> {
        self.existing(ty, handle)?.rep(handle).ok_or_else(|| {
            ComponentError::new(
                Phase::Runtime,
                ErrorKind::InvalidInput,
                format!("handle {handle}: already dropped (type {ty})"),
            )
            .into()
        })
    }

    /// Guest-side `resource.drop`: releases one reference and runs the
    /// destructor when the final reference goes away.
    pub fn resource_drop(&mut self, ty: u32, handle: Handle) -> Result<(), Error> {
        let (rep, needs_destructor) = self.existing_mut(ty, handle)?.drop_handle(handle)?;
        if needs_destructor {
            self.existing(ty, handle)?.run_destructor(rep)?;
        }
        Ok(())
    }

    /// `lift-own`: transfers ownership out of the table, returning the
    /// representation without running the destructor.
    pub fn lift_own(&mut self, ty: u32, handle: Handle) -> Result<u32, Error> {
        self.existing_mut(ty, handle)?.take(handle)
    }

    /// `lift-borrow`: reads the representation and marks the handle
    /// lent. Callers must pair this with [`Self::end_lift_borrow`]
    /// regardless of the call outcome.
    pub fn lift_borrow(&mut self, ty: u32, handle: Handle) -> Result<u32, Error> {
        self.existing_mut(ty, handle)?.borrow(handle)
    }

    /// Ends the borrow opened by [`Self::lift_borrow`].
    pub fn end_lift_borrow(&mut self, ty: u32, handle: Handle) -> Result<(), Error> {
        self.existing_mut(ty, handle)?.end_borrow(handle)
    }

    /// `lower-own`: produces a fresh owned handle for a representation
    /// entering this table.
    pub fn lower_own(&mut self, ty: u32, rep: u32) -> Handle {
        self.table(ty).new_handle(rep)
    }

    /// `lower-borrow`: produces a temporary handle for the duration of
    /// one call.
    pub fn lower_borrow(&mut self, ty: u32, rep: u32) -> Handle {
        self.table(ty).new_handle(rep)
    }

    /// Retires the temporary handle of [`Self::lower_borrow`]. The
    /// destructor never runs: the host kept ownership.
    pub fn end_lower_borrow(&mut self, ty: u32, handle: Handle) -> Result<(), Error> {
        self.existing_mut(ty, handle)?.drop_handle(handle)?;
        Ok(())
    }

    /// Attaches a destructor to a type's table at first touch.
    pub fn set_destructor(&mut self, ty: u32, destructor: Destructor) {
        self.table(ty).set_destructor(destructor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn accounting_destructor_fires_once_on_final_drop() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut store = ResourceStore::new();
        let fired2 = Arc::clone(&fired);
        store.set_destructor(
            7,
            Arc::new(move |rep| {
                assert_eq!(rep, 42);
                fired2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let h = store.resource_new(7, 42);
        let clones = 3;
        for _ in 0..clones {
            store.table(7).clone_handle(h).unwrap();
        }
        for _ in 0..clones {
            store.resource_drop(7, h).unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }
        store.resource_drop(7, h).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.resource_drop(7, h).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn borrow_blocks_drop_until_balanced() {
        let mut table = ResourceTable::new();
        let h = table.new_handle(9);
        table.borrow(h).unwrap();
        table.borrow(h).unwrap();
        assert!(table.drop_handle(h).is_err());
        assert!(table.is_live(h));
        table.end_borrow(h).unwrap();
        assert!(table.drop_handle(h).is_err());
        table.end_borrow(h).unwrap();
        assert!(table.end_borrow(h).is_err());
        table.drop_handle(h).unwrap();
        assert!(!table.is_live(h));
    }

    #[test]
    fn freed_handles_are_reused_lifo() {
        let mut table = ResourceTable::new();
        let a = table.new_handle(1);
        let b = table.new_handle(2);
        assert_ne!(a, b);
        table.drop_handle(a).unwrap();
        table.drop_handle(b).unwrap();
        assert_eq!(table.new_handle(3), b);
        assert_eq!(table.new_handle(4), a);
    }

    #[test]
    fn lift_own_transfers_without_destructor() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut store = ResourceStore::new();
        let fired2 = Arc::clone(&fired);
        store.set_destructor(
            1,
            Arc::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let h = store.resource_new(1, 5);
        assert_eq!(store.lift_own(1, h).unwrap(), 5);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(store.resource_rep(1, h).is_err());
    }

    #[test]
    fn lower_borrow_round_trip() {
        let mut store = ResourceStore::new();
        let h = store.lower_borrow(4, 77);
        assert_eq!(store.resource_rep(4, h).unwrap(), 77);
        store.end_lower_borrow(4, h).unwrap();
        assert!(store.resource_rep(4, h).is_err());
    }

    #[test]
    fn clone_after_drop_fails() {
        let mut table = ResourceTable::new();
        let h = table.new_handle(0);
        table.drop_handle(h).unwrap();
        assert!(table.clone_handle(h).is_err());
    }
}
