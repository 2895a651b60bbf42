//! [`ConcurrentBag`] — the heart of the pool.
//!
//! A thread-safe, LIFO collection of entries with direct handoff to waiters.
//! Per-entry state transitions are lock-free (a single `AtomicU8` CAS); the
//! container that holds the set of entries (for scanning/insertion/removal)
//! is guarded by a `parking_lot::RwLock`, following the shape of HikariCP's
//! `ConcurrentBag` (`CopyOnWriteArrayList` + per-entry `AtomicInteger`
//! state) translated to Rust's atomics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::fast_list::FastList;

/// The bag-state of an entry, used exclusively by `ConcurrentBag`'s
/// lock-free protocol (independent from any lifecycle state the caller
/// layers on top).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BagState {
    NotInUse = 0,
    InUse = 1,
    Removed = 2,
    Reserved = 3,
}

impl BagState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BagState::NotInUse,
            1 => BagState::InUse,
            2 => BagState::Removed,
            _ => BagState::Reserved,
        }
    }
}

/// One entry held by the bag: the caller's item plus the atomic bag-state
/// CAS field.
#[derive(Debug)]
pub struct BagEntry<T> {
    pub item: T,
    state: AtomicU8,
}

impl<T> BagEntry<T> {
    pub(crate) fn new(item: T, state: BagState) -> Self {
        Self {
            item,
            state: AtomicU8::new(state as u8),
        }
    }

    /// Current bag-state, for observation only.
    pub fn state(&self) -> BagState {
        BagState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`. Returns whether the CAS succeeded.
    fn compare_and_set(&self, from: BagState, to: BagState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

type Entry<T> = Arc<BagEntry<T>>;

struct Waiter<T> {
    tx: oneshot::Sender<Entry<T>>,
}

thread_local! {
    // HikariCP's `ConcurrentBag` keeps a `ThreadLocal<List<PoolEntry>>` so a
    // thread that previously borrowed an entry prefers to borrow the same
    // entry again (cache locality). This is a soft optimization only: in a
    // multi-threaded tokio runtime a task's borrow/requite pair may happen
    // on different worker threads, in which case this cache is simply
    // empty and borrow() falls back to the shared scan.
    //
    // Keyed by each bag's own `id` (not just its item type `T`): two
    // `ConcurrentBag<T>` instances with the same `T` can run tasks on the
    // same worker thread, and a cache keyed only by the downcast type would
    // let one bag reclaim and hand out an entry that actually belongs to
    // the other's `shared` list.
    static LOCAL_CACHE: std::cell::RefCell<HashMap<u64, Vec<Box<dyn std::any::Any>>>> =
        std::cell::RefCell::new(HashMap::new());
}

static NEXT_BAG_ID: AtomicU64 = AtomicU64::new(0);

/// A thread-safe, LIFO collection of entries with direct handoff to waiters.
pub struct ConcurrentBag<T: Send + Sync + 'static> {
    id: u64,
    shared: RwLock<Vec<Entry<T>>>,
    waiters: parking_lot::Mutex<VecDeque<Waiter<T>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl<T: Send + Sync + 'static> Default for ConcurrentBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> ConcurrentBag<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_BAG_ID.fetch_add(1, Ordering::Relaxed),
            shared: RwLock::new(Vec::new()),
            waiters: parking_lot::Mutex::new(VecDeque::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push_local(&self, entry: Entry<T>) {
        let id = self.id;
        LOCAL_CACHE.with(|cache| {
            cache.borrow_mut().entry(id).or_default().push(Box::new(entry));
        });
    }

    /// Insert a new entry in `NotInUse` state; if a waiter is registered,
    /// hand it off directly instead of making it available to scans.
    pub fn add(&self, item: T) -> Entry<T> {
        let entry = Arc::new(BagEntry::new(item, BagState::NotInUse));
        self.shared.write().push(entry.clone());
        self.offer_to_waiter(entry.clone());
        entry
    }

    /// Insert an entry that is already `InUse` (the caller is about to hand
    /// it straight to a borrower without routing it through idle).
    pub fn add_in_use(&self, item: T) -> Entry<T> {
        let entry = Arc::new(BagEntry::new(item, BagState::InUse));
        self.shared.write().push(entry.clone());
        entry
    }

    /// Try to hand `entry` (currently `NotInUse`) to the oldest waiter.
    /// Loops past waiters whose receiver has already gone away.
    fn offer_to_waiter(&self, entry: Entry<T>) {
        loop {
            let waiter = self.waiters.lock().pop_front();
            match waiter {
                None => return,
                Some(w) => {
                    if !entry.compare_and_set(BagState::NotInUse, BagState::InUse) {
                        // Someone else grabbed it first (e.g. remove()).
                        return;
                    }
                    if w.tx.send(entry.clone()).is_ok() {
                        return;
                    }
                    // Receiver dropped (timed out / cancelled): make the
                    // entry available again and try the next waiter.
                    entry.compare_and_set(BagState::InUse, BagState::NotInUse);
                }
            }
        }
    }

    /// Borrow an entry, suspending up to `timeout` if none is immediately
    /// available. Returns `None` on timeout or if the bag is closed.
    pub async fn borrow(&self, timeout: Duration) -> Option<Entry<T>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        // 1. Prefer a previously held entry from this thread's local cache,
        // scoped to this bag's own id.
        let mut reclaimed: Option<Entry<T>> = None;
        let id = self.id;
        LOCAL_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            let Some(local) = cache.get_mut(&id) else {
                return;
            };
            let mut i = local.len();
            while i > 0 {
                i -= 1;
                let hit = local[i]
                    .downcast_ref::<Entry<T>>()
                    .filter(|entry| entry.compare_and_set(BagState::NotInUse, BagState::InUse))
                    .cloned();
                if let Some(entry) = hit {
                    reclaimed = Some(entry);
                    local.remove(i);
                    return;
                }
            }
        });
        if let Some(entry) = reclaimed {
            return Some(entry);
        }

        // 2. Scan the shared list LIFO.
        if let Some(entry) = self.scan_shared() {
            return Some(entry);
        }

        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        // 3. Register a waiter and suspend.
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(Waiter { tx });

        // A late add() or requite() may have landed between step 2 and
        // registering the waiter; re-scan once more before suspending, and
        // drop the (now-stale) waiter registration if we find one.
        if let Some(entry) = self.scan_shared() {
            return Some(entry);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(entry)) => Some(entry),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    fn scan_shared(&self) -> Option<Entry<T>> {
        let shared = self.shared.read();
        for entry in shared.iter().rev() {
            if entry.compare_and_set(BagState::NotInUse, BagState::InUse) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Return `entry` to the bag: mark it `NotInUse`, and hand it directly
    /// to a waiter if one exists. A previously `Removed` entry is dropped
    /// silently instead of being re-offered — this is the layer where
    /// double-release of a proxy becomes a no-op (see `ConnectionProxy`).
    pub fn requite(&self, entry: Entry<T>) {
        if !entry.compare_and_set(BagState::InUse, BagState::NotInUse) {
            // Already Removed (or already NotInUse): nothing to do.
            return;
        }
        self.push_local(entry.clone());
        self.offer_to_waiter(entry);
    }

    /// Mark `entry` `Removed` (from either `InUse` or `NotInUse`) and drop
    /// it from the shared list. Removal succeeds even for in-use entries;
    /// the eventual `requite` will observe `Removed` and drop it instead of
    /// re-offering it.
    pub fn remove(&self, entry: &Entry<T>) -> bool {
        let removed = entry.compare_and_set(BagState::InUse, BagState::Removed)
            || entry.compare_and_set(BagState::NotInUse, BagState::Removed)
            || entry.compare_and_set(BagState::Reserved, BagState::Removed);
        if removed {
            self.shared
                .write()
                .retain(|e| !Arc::ptr_eq(e, entry));
        }
        removed
    }

    /// Reject future adds and borrows. Existing entries remain drainable via
    /// [`ConcurrentBag::drain`] for shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Wake every waiter with a closed signal (dropping the sender
        // causes their receiver to resolve to an error, i.e. `None`).
        let mut waiters = self.waiters.lock();
        waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of entries currently tracked (any state).
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.read().is_empty()
    }

    /// Number of suspended `borrow` callers currently waiting for a
    /// direct handoff.
    pub fn waiting_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Snapshot of all live entries, for house-keeping/status scans.
    pub fn snapshot(&self) -> Vec<Entry<T>> {
        self.shared.read().clone()
    }

    /// Drain all entries for shutdown, regardless of state.
    pub fn drain(&self) -> Vec<Entry<T>> {
        std::mem::take(&mut *self.shared.write())
    }
}
