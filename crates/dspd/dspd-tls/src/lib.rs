//! `dspd-tls`: signal-safe thread-local storage for a single pointer
//! per OS thread (spec.md §4.9 `Thread-Local Slot`).
//!
//! Grounded on `dspdtls.c`: the `__thread` keyword is not guaranteed to
//! be readable from a signal handler on every platform, so the original
//! keeps its own singly-linked list of `(tid, ptr)` slots and finds the
//! current thread's slot with a plain atomic scan. [`get`] only ever
//! performs atomic loads, so it is safe to call from a signal handler;
//! [`set`] and [`clear`] are not, and must be called from ordinary
//! thread context (typically once near thread start/exit).
//!
//! Slots are claimed by CAS-ing a slot's `tid` field away from
//! [`EMPTY`] and released the same way; a slot whose owning thread
//! exits without calling [`clear`] is leaked for the life of the
//! process (as in the original: "a slot can be reused but it can't be
//! freed, since all pointers must be safe to follow").

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::{Mutex, OnceLock};

/// Sentinel `tid` marking a slot as unclaimed.
const EMPTY: i32 = -1;

struct Slot {
    tid: AtomicI32,
    ptr: AtomicPtr<()>,
    next: AtomicPtr<Slot>,
}

impl Slot {
    fn leaked(tid: i32, ptr: *mut ()) -> *mut Slot {
        Box::into_raw(Box::new(Slot {
            tid: AtomicI32::new(tid),
            ptr: AtomicPtr::new(ptr),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A registry of thread-to-pointer slots. The process normally uses a
/// single instance via the free functions [`get`], [`set`], [`clear`];
/// this type exists as a separate name mainly so tests can construct
/// independent registries instead of sharing process-global state.
pub struct SlotRegistry {
    head: AtomicPtr<Slot>,
    grow_lock: Mutex<()>,
}

impl SlotRegistry {
    pub const fn new() -> Self {
        SlotRegistry {
            head: AtomicPtr::new(ptr::null_mut()),
            grow_lock: Mutex::new(()),
        }
    }

    /// Returns the pointer stored for the calling thread, or null if
    /// none has been set. Performs only atomic loads: safe to call
    /// from a signal handler.
    pub fn get(&self) -> *mut () {
        let tid = current_tid();
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let slot = unsafe { &*node };
            if slot.tid.load(Ordering::Acquire) == tid {
                return slot.ptr.load(Ordering::Acquire);
            }
            node = slot.next.load(Ordering::Acquire);
        }
        ptr::null_mut()
    }

    /// Binds `value` to the calling thread's slot, claiming an empty
    /// slot via CAS or allocating a new one under `grow_lock` if none
    /// is free. Not signal safe.
    pub fn set(&self, value: *mut ()) {
        let tid = current_tid();
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let slot = unsafe { &*node };
            if slot
                .tid
                .compare_exchange(EMPTY, tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.ptr.store(value, Ordering::Release);
                return;
            }
            node = slot.next.load(Ordering::Acquire);
        }

        // No empty slot found under the lock-free scan; serialize
        // growth so two threads racing to extend the list can't both
        // append onto the same tail slot.
        let _guard = self.grow_lock.lock().unwrap();
        // Re-scan: another thread may have freed or grown a slot while
        // we were waiting for the lock.
        node = self.head.load(Ordering::Acquire);
        let mut tail: Option<*mut Slot> = None;
        while !node.is_null() {
            let slot = unsafe { &*node };
            if slot
                .tid
                .compare_exchange(EMPTY, tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.ptr.store(value, Ordering::Release);
                return;
            }
            tail = Some(node);
            node = slot.next.load(Ordering::Acquire);
        }

        let new_slot = Slot::leaked(tid, value);
        match tail {
            Some(last) => unsafe {
                (*last).next.store(new_slot, Ordering::Release);
            },
            None => self.head.store(new_slot, Ordering::Release),
        }
    }

    /// Releases the calling thread's slot, if it has one. Not signal
    /// safe. Must be called before the thread exits if it ever called
    /// [`set`], since the slot is never freed and otherwise keeps
    /// pointing at a dead thread's `ptr`.
    pub fn clear(&self) {
        let tid = current_tid();
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let slot = unsafe { &*node };
            if slot
                .tid
                .compare_exchange(tid, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.ptr.store(ptr::null_mut(), Ordering::Release);
                return;
            }
            node = slot.next.load(Ordering::Acquire);
        }
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Slot lists are only ever appended to and never freed, and every
// field access goes through an atomic op, so sharing `*mut Slot`
// across threads is sound.
unsafe impl Send for SlotRegistry {}
unsafe impl Sync for SlotRegistry {}

fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

static GLOBAL: OnceLock<SlotRegistry> = OnceLock::new();

fn global() -> &'static SlotRegistry {
    GLOBAL.get_or_init(SlotRegistry::new)
}

/// See [`SlotRegistry::get`], against the process-wide registry.
pub fn get() -> *mut () {
    global().get()
}

/// See [`SlotRegistry::set`], against the process-wide registry.
pub fn set(value: *mut ()) {
    global().set(value)
}

/// See [`SlotRegistry::clear`], against the process-wide registry.
pub fn clear() {
    global().clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn unset_slot_reads_as_null() {
        let reg = SlotRegistry::new();
        assert!(reg.get().is_null());
    }

    #[test]
    fn set_then_get_round_trips_within_one_thread() {
        let reg = SlotRegistry::new();
        let mut value = 7i32;
        reg.set(&mut value as *mut i32 as *mut ());
        assert_eq!(reg.get(), &mut value as *mut i32 as *mut ());
        reg.clear();
        assert!(reg.get().is_null());
    }

    #[test]
    fn each_thread_sees_only_its_own_slot() {
        let reg = SlotRegistry::new();
        let mut a = 1i32;
        reg.set(&mut a as *mut i32 as *mut ());

        let seen_from_other_thread = thread::scope(|scope| {
            scope
                .spawn(|| {
                    // A freshly spawned thread has never called `set`,
                    // so its tid cannot already occupy a slot.
                    reg.get()
                })
                .join()
                .unwrap()
        });

        assert!(seen_from_other_thread.is_null());
        assert_eq!(reg.get(), &mut a as *mut i32 as *mut ());
        reg.clear();
    }

    #[test]
    fn slot_is_reused_after_clear() {
        let reg = SlotRegistry::new();
        let mut a = 1i32;
        reg.set(&mut a as *mut i32 as *mut ());
        reg.clear();

        let reused = thread::scope(|scope| {
            scope
                .spawn(|| {
                    let mut b = 2i32;
                    reg.set(&mut b as *mut i32 as *mut ());
                    let got = reg.get();
                    reg.clear();
                    got == (&mut b as *mut i32 as *mut ())
                })
                .join()
                .unwrap()
        });
        assert!(reused);
    }

    #[test]
    fn concurrent_threads_each_keep_their_own_value() {
        let reg = SlotRegistry::new();
        thread::scope(|scope| {
            for i in 0..8i32 {
                scope.spawn(move || {
                    let mut v = i;
                    reg.set(&mut v as *mut i32 as *mut ());
                    let got = unsafe { *(reg.get() as *mut i32) };
                    assert_eq!(got, i);
                    reg.clear();
                });
            }
        });
    }
}
