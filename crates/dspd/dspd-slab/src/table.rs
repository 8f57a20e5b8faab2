//! Fixed-capacity keyed slot table (spec.md §4.4 `Keyed Slot Table`,
//! §3 `SlotTable entry`).
//!
//! Holds the devices, clients, and AIO contexts the rest of the crate
//! family refers to by index. Each slot has its own reader/writer lock
//! and keyed spinlock so the realtime path never contends with the
//! non-realtime control path on a global lock.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dspd_common::Errno;

use crate::keyed_lock::KeyedLock;

/// Direction to scan for a free slot. The AIO transport's own op-slot
/// search walks backwards from its current cursor so the ring shrinks
/// back down once idle (spec.md §4.5.3); the same trick applies here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Forward,
    Backward,
}

pub type CtlFn<T> = dyn Fn(&mut T, u32, &[u8], &mut Vec<u8>) -> i32 + Send + Sync;

struct SlotState<T> {
    used: bool,
    data: Option<T>,
    ctl: Option<Arc<CtlFn<T>>>,
}

struct Slot<T> {
    inner: RwLock<SlotState<T>>,
    keyed: KeyedLock,
    refcount: AtomicU32,
    slot_id: AtomicU64,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            inner: RwLock::new(SlotState {
                used: false,
                data: None,
                ctl: None,
            }),
            keyed: KeyedLock::new(),
            refcount: AtomicU32::new(0),
            slot_id: AtomicU64::new(0),
        }
    }
}

pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
}

/// A slot found free by [`SlotTable::get_free`], already holding its
/// write lock and its keyed lock. Populate `data`, call
/// [`FreeSlot::finish`] to mark it used and bind a key, then drop the
/// guard to release both locks.
pub struct FreeSlot<'a, T> {
    table: &'a SlotTable<T>,
    index: usize,
    guard: RwLockWriteGuard<'a, SlotState<T>>,
}

impl<'a, T> FreeSlot<'a, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Marks the slot used, stores `data`, and binds `key` as the slot's
    /// new keyed-lock key (spec.md §4.4: "`slot_id` increments on every
    /// `set_used(true)` so stale references can be detected").
    pub fn finish(mut self, data: T, key: u32, ctl: Option<Arc<CtlFn<T>>>) -> usize {
        self.guard.used = true;
        self.guard.data = Some(data);
        self.guard.ctl = ctl;
        self.table.slots[self.index]
            .slot_id
            .store(self.table.next_id.fetch_add(1, Ordering::Relaxed), Ordering::Release);
        self.table.slots[self.index].keyed.set_key(key);
        self.table.slots[self.index].refcount.store(1, Ordering::Release);
        self.index
    }
}

impl<'a, T> Deref for FreeSlot<'a, T> {
    type Target = Option<T>;
    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

impl<'a, T> DerefMut for FreeSlot<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data
    }
}

impl<'a, T> Drop for FreeSlot<'a, T> {
    fn drop(&mut self) {
        self.table.slots[self.index].keyed.unlock();
    }
}

impl<T> SlotTable<T> {
    pub fn new(entries: usize) -> Self {
        SlotTable {
            slots: (0..entries).map(|_| Slot::new()).collect(),
            next_id: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn scan_order(&self, whence: Whence) -> Vec<usize> {
        let n = self.slots.len();
        let start = self.cursor.load(Ordering::Relaxed);
        (0..n)
            .map(|o| match whence {
                Whence::Forward => (start + o) % n,
                Whence::Backward => (start + n - o) % n,
            })
            .collect()
    }

    /// Finds an unused slot and returns it already holding the write lock
    /// and the keyed lock (spec.md §4.4: "`get_free(direction) -> index
    /// holding-writer+keyed-locks`"). Skips slots another caller is
    /// currently touching rather than waiting on them.
    pub fn get_free(&self, whence: Whence) -> Option<FreeSlot<'_, T>> {
        for i in self.scan_order(whence) {
            let slot = &self.slots[i];
            let Some(guard) = slot.inner.try_write() else {
                continue;
            };
            if guard.used {
                continue;
            }
            let current_key = slot.keyed.key();
            if !slot.keyed.try_lock(current_key) {
                continue;
            }
            self.cursor.store(i, Ordering::Relaxed);
            return Some(FreeSlot {
                table: self,
                index: i,
                guard,
            });
        }
        None
    }

    pub fn set_used(&self, index: usize, used: bool) {
        let mut guard = self.slots[index].inner.write();
        guard.used = used;
        if !used {
            guard.data = None;
            guard.ctl = None;
        }
    }

    pub fn set_key(&self, index: usize, key: u32) {
        self.slots[index].keyed.set_key(key);
    }

    pub fn key(&self, index: usize) -> u32 {
        self.slots[index].keyed.key()
    }

    pub fn slot_id(&self, index: usize) -> u64 {
        self.slots[index].slot_id.load(Ordering::Acquire)
    }

    pub fn refcnt(&self, index: usize) -> u32 {
        self.slots[index].refcount.load(Ordering::Acquire)
    }

    /// Increments the refcount and returns the new value.
    pub fn reference(&self, index: usize) -> u32 {
        self.slots[index].refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the refcount; at zero, clears the slot (dropping `T`
    /// runs its destructor) and returns 0.
    pub fn unref(&self, index: usize) -> u32 {
        let prev = self.slots[index].refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.set_used(index, false);
            0
        } else {
            prev - 1
        }
    }

    pub fn srv_lock_keyed(&self, index: usize, key: u32) -> bool {
        self.slots[index].keyed.lock(key)
    }

    pub fn srv_try_lock_keyed(&self, index: usize, key: u32) -> bool {
        self.slots[index].keyed.try_lock(key)
    }

    pub fn srv_unlock(&self, index: usize) {
        self.slots[index].keyed.unlock();
    }

    pub fn rd_lock(&self, index: usize) -> MappedRwLockReadGuard<'_, Option<T>> {
        RwLockReadGuard::map(self.slots[index].inner.read(), |s| &s.data)
    }

    pub fn wr_lock(&self, index: usize) -> MappedRwLockWriteGuard<'_, Option<T>> {
        RwLockWriteGuard::map(self.slots[index].inner.write(), |s| &mut s.data)
    }

    pub fn set_ctl(&self, index: usize, ctl: Arc<CtlFn<T>>) {
        self.slots[index].inner.write().ctl = Some(ctl);
    }

    /// Dispatches `req` to the slot's registered control callback,
    /// installing a default error reply if the slot is empty (spec.md
    /// §4.4: "the dispatcher installs a default error reply if the slot
    /// is empty").
    pub fn ctl(&self, index: usize, req: u32, inbuf: &[u8], outbuf: &mut Vec<u8>) -> i32 {
        let mut guard = self.slots[index].inner.write();
        if !guard.used {
            return Errno::NoDev.neg();
        }
        let SlotState { data, ctl, .. } = &mut *guard;
        match (data.as_mut(), ctl.clone()) {
            (Some(data), Some(ctl)) => ctl(data, req, inbuf, outbuf),
            _ => Errno::NoSys.neg(),
        }
    }

    /// Fills `mask` with a bitset of used slots (one bit per slot index),
    /// returning the number of bits that were set (spec.md §4.4 via
    /// `dspd_slist_get_object_mask`).
    pub fn object_mask(&self, mask: &mut [u8]) -> usize {
        let mut count = 0;
        for byte in mask.iter_mut() {
            *byte = 0;
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.inner.read().used {
                let byte = i / 8;
                if byte < mask.len() {
                    mask[byte] |= 1 << (i % 8);
                    count += 1;
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_free_allocates_and_finish_marks_used() {
        let table: SlotTable<&'static str> = SlotTable::new(4);
        let free = table.get_free(Whence::Forward).expect("a slot is free");
        let idx = free.finish("hello", 11, None);
        assert_eq!(table.refcnt(idx), 1);
        assert!(table.rd_lock(idx).is_some());
        assert_eq!(table.key(idx), 11);
    }

    #[test]
    fn slot_id_increments_each_allocation() {
        let table: SlotTable<u32> = SlotTable::new(2);
        let a = table.get_free(Whence::Forward).unwrap().finish(1, 1, None);
        table.unref(a);
        let b = table.get_free(Whence::Forward).unwrap().finish(2, 1, None);
        assert!(table.slot_id(b) > table.slot_id(a));
    }

    #[test]
    fn unref_to_zero_clears_slot() {
        let table: SlotTable<u32> = SlotTable::new(2);
        let idx = table.get_free(Whence::Forward).unwrap().finish(5, 1, None);
        table.reference(idx);
        assert_eq!(table.unref(idx), 1);
        assert_eq!(table.unref(idx), 0);
        assert!(table.rd_lock(idx).is_none());
    }

    #[test]
    fn rebinding_key_blocks_stale_keyed_lock_holder() {
        let table: SlotTable<u32> = SlotTable::new(1);
        let idx = table.get_free(Whence::Forward).unwrap().finish(0, 42, None);
        assert!(table.srv_try_lock_keyed(idx, 42));
        table.srv_unlock(idx);
        table.set_key(idx, 43);
        assert!(!table.srv_try_lock_keyed(idx, 42));
        assert!(table.srv_try_lock_keyed(idx, 43));
    }

    #[test]
    fn ctl_on_empty_slot_returns_default_error() {
        let table: SlotTable<u32> = SlotTable::new(1);
        let mut out = Vec::new();
        let rc = table.ctl(0, 7, &[], &mut out);
        assert_eq!(rc, Errno::NoDev.neg());
    }

    #[test]
    fn object_mask_reports_used_slots() {
        let table: SlotTable<u32> = SlotTable::new(10);
        let idx = table.get_free(Whence::Forward).unwrap().finish(1, 1, None);
        let mut mask = [0u8; 2];
        let count = table.object_mask(&mut mask);
        assert_eq!(count, 1);
        assert_eq!(mask[idx / 8] & (1 << (idx % 8)), 1 << (idx % 8));
    }
}
