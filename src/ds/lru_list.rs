//! Concurrent doubly linked list specialised for LRU caching. It supports
//! only `push_front`, `move_to_front` and `pop_back`.
//!
//! Under cache workloads almost every operation lands on the head region, so
//! insertions are asynchronous: `push_front` returns a handle immediately
//! and hands the physical link-in to a dedicated worker thread behind an
//! unbounded channel. A `pending_insertions` counter tracks handed-off nodes
//! that are not yet linked; [`LruList::wait_for_insertions`] busy-polls it to
//! zero and is the quiescence barrier used by tests and shutdown.
//!
//! Consequences of the asynchronous design:
//!
//! - the order of elements may vary slightly under load, and a freshly
//!   pushed element may not be visible to `pop_back` yet;
//! - `pop_back` never waits for pending insertions, so it can report an
//!   empty list while `len` is positive;
//! - a node counts as a member of the list from the moment `push_front`
//!   returns, even before it is physically linked.
//!
//! `move_to_front` also accepts elements belonging to a different `LruList`;
//! the unlink debits the source list's length and credits this one before
//! the reinsert is scheduled.
//!
//! Locking follows the same head-to-tail protocol as
//! [`LinkedList`](crate::ds::LinkedList), with exclusive per-node locks.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};

#[cfg(any(test, debug_assertions))]
use crate::error::InvariantError;

/// Link block guarded by each node's lock. The lock covers the link fields
/// and the value.
struct Links<T> {
    next: Option<Arc<Node<T>>>,
    prev: Option<Weak<Node<T>>>,
    list: Option<Weak<Shared<T>>>,
    value: Option<T>,
}

impl<T> Links<T> {
    fn belongs_to(&self, shared: &Arc<Shared<T>>) -> bool {
        self.list
            .as_ref()
            .is_some_and(|w| w.upgrade().is_some_and(|l| Arc::ptr_eq(&l, shared)))
    }
}

struct Node<T> {
    links: Mutex<Links<T>>,
}

impl<T> Node<T> {
    fn detached(value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(Links {
                next: None,
                prev: None,
                list: None,
                value,
            }),
        })
    }
}

struct Shared<T> {
    head: Arc<Node<T>>,
    tail: Arc<Node<T>>,
    len: AtomicI64,
    /// Count of nodes handed to the link-in worker and not yet linked.
    pending: AtomicI64,
}

impl<T> Shared<T> {
    fn new() -> Arc<Self> {
        let head = Node::detached(None);
        let tail = Node::detached(None);
        let shared = Arc::new(Shared {
            head: head.clone(),
            tail: tail.clone(),
            len: AtomicI64::new(0),
            pending: AtomicI64::new(0),
        });
        {
            let mut head_g = head.links.lock();
            head_g.next = Some(tail.clone());
            head_g.list = Some(Arc::downgrade(&shared));
        }
        {
            let mut tail_g = tail.links.lock();
            tail_g.prev = Some(Arc::downgrade(&head));
            tail_g.list = Some(Arc::downgrade(&shared));
        }
        shared
    }

    /// Physically links `e` as the first element of `shared`. Locks the head
    /// sentinel, `e`, and the old first element, in that order, then retires
    /// one pending insertion.
    fn link_front(shared: &Arc<Shared<T>>, e: &Arc<Node<T>>) {
        {
            let mut head_g = shared.head.links.lock();
            if let Some(next) = head_g.next.clone() {
                let mut e_g = e.links.lock();
                let mut next_g = next.links.lock();

                e_g.prev = Some(Arc::downgrade(&shared.head));
                e_g.next = Some(next.clone());
                e_g.list = Some(Arc::downgrade(shared));
                head_g.next = Some(e.clone());
                next_g.prev = Some(Arc::downgrade(e));
            }
        }
        shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to one element of an [`LruList`]. Cheap to clone; identity is
/// pointer identity ([`LruElement::ptr_eq`]).
pub struct LruElement<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for LruElement<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> LruElement<T> {
    /// Runs `f` on a shared reference to the value, if still present.
    pub fn value_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.node.links.lock().value.as_ref().map(f)
    }

    /// Returns a clone of the value, if still present.
    pub fn value_cloned(&self) -> Option<T>
    where
        T: Clone,
    {
        self.node.links.lock().value.clone()
    }

    /// Moves the value out of the element, leaving it empty.
    pub fn take_value(&self) -> Option<T> {
        self.node.links.lock().value.take()
    }

    /// Returns `true` if both handles refer to the same element.
    pub fn ptr_eq(&self, other: &LruElement<T>) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl<T> fmt::Debug for LruElement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruElement")
            .field("node", &Arc::as_ptr(&self.node))
            .finish()
    }
}

/// Concurrent list with asynchronous, counted front insertions. All
/// operations take `&self` and are safe to call from many threads at once.
pub struct LruList<T> {
    shared: Arc<Shared<T>>,
    inserts: RwLock<Option<Sender<Arc<Node<T>>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> LruList<T> {
    /// Creates an empty list and starts its link-in worker.
    pub fn new() -> Self {
        let shared = Shared::new();
        let (tx, rx) = unbounded::<Arc<Node<T>>>();
        let link_shared = shared.clone();
        let worker = thread::spawn(move || {
            for node in rx {
                Shared::link_front(&link_shared, &node);
            }
        });
        Self {
            shared,
            inserts: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl<T: Send + 'static> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    /// Returns the number of elements, counting insertions that are still
    /// pending. O(1).
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst).max(0) as usize
    }

    /// Returns `true` if the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of insertions that have been scheduled but not yet
    /// physically linked.
    pub fn pending_insertions(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst).max(0) as usize
    }

    /// Busy-polls until every scheduled insertion has been linked in. This
    /// is the quiescence barrier: once it returns (and no new operations
    /// start), a walk of the list sees exactly `len` elements.
    pub fn wait_for_insertions(&self) {
        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }

    /// Inserts `value` at the front and returns its element immediately.
    /// The physical link-in happens asynchronously; the element already
    /// counts as a member of this list.
    pub fn push_front(&self, value: T) -> LruElement<T> {
        let node = Arc::new(Node {
            links: Mutex::new(Links {
                next: None,
                prev: None,
                list: Some(Arc::downgrade(&self.shared)),
                value: Some(value),
            }),
        });
        self.shared.len.fetch_add(1, Ordering::SeqCst);
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.dispatch(node.clone());
        LruElement { node }
    }

    /// Moves `e` to the front of this list. `e` may belong to a different
    /// `LruList`; the element is then transferred here along with its length
    /// count.
    ///
    /// Returns `true` if this call performed the move, or if `e` already
    /// belongs to this list (a racing mover got there first, or its link-in
    /// is still pending). Returns `false` if `e` was removed and belongs to
    /// no list, or belongs to another list and could not be unlinked.
    pub fn move_to_front(&self, e: &LruElement<T>) -> bool {
        if self.unlink(&e.node, false, Some(&self.shared)) {
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            self.dispatch(e.node.clone());
            return true;
        }
        // someone else is already moving e here, or its link-in is pending
        e.node.links.lock().belongs_to(&self.shared)
    }

    /// Removes and returns the last element, or `None` if the list is empty
    /// at observation time. Pending insertions are not awaited.
    pub fn pop_back(&self) -> Option<LruElement<T>> {
        loop {
            let prev = {
                let tail_g = self.shared.tail.links.lock();
                match tail_g.prev.as_ref().and_then(Weak::upgrade) {
                    Some(p) => p,
                    None => return None,
                }
            };
            if Arc::ptr_eq(&prev, &self.shared.head) {
                return None;
            }
            let linked = {
                let prev_g = prev.links.lock();
                prev_g
                    .next
                    .as_ref()
                    .is_some_and(|n| Arc::ptr_eq(n, &self.shared.tail))
            };
            if !linked {
                // the last element changed before we got the lock, try again
                continue;
            }
            return if self.unlink(&prev, true, None) {
                Some(LruElement { node: prev })
            } else {
                None
            };
        }
    }

    /// Shuts the link-in worker down after it drains every scheduled
    /// insertion. Idempotent. Insertions requested afterwards are applied
    /// inline on the calling thread.
    pub fn close(&self) {
        drop(self.inserts.write().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    /// Hands a node to the link-in worker, or links it inline once the list
    /// is closed.
    fn dispatch(&self, node: Arc<Node<T>>) {
        let node = {
            let g = self.inserts.read();
            match g.as_ref() {
                Some(tx) => match tx.send(node) {
                    Ok(()) => return,
                    Err(err) => err.0,
                },
                None => node,
            }
        };
        Shared::link_front(&self.shared, &node);
    }

    /// Unlinks `e` wherever it is physically linked, retargeting its
    /// membership to `new_list` and transferring length counts when the
    /// lists differ. Returns `false` if `e` is not linked (removed, or its
    /// link-in is still pending) or, when `validate` is set, not a member of
    /// this list.
    fn unlink(&self, e: &Arc<Node<T>>, validate: bool, new_list: Option<&Arc<Shared<T>>>) -> bool {
        loop {
            let prev = {
                let e_g = e.links.lock();
                if validate && !e_g.belongs_to(&self.shared) {
                    return false;
                }
                match e_g.prev.as_ref().and_then(Weak::upgrade) {
                    Some(p) => p,
                    None => return false,
                }
            };
            let mut prev_g = prev.links.lock();
            if !prev_g.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, e)) {
                // e got a new predecessor before we got the lock, try again
                continue;
            }
            let mut e_g = e.links.lock();
            if validate && !e_g.belongs_to(&self.shared) {
                return false;
            }
            let next = match e_g.next.clone() {
                Some(n) => n,
                None => return false,
            };
            let mut next_g = next.links.lock();

            let old_list = e_g.list.as_ref().and_then(Weak::upgrade);
            let same_list = match (&old_list, new_list) {
                (Some(old), Some(new)) => Arc::ptr_eq(old, new),
                (None, None) => true,
                _ => false,
            };
            if !same_list {
                if let Some(old) = &old_list {
                    old.len.fetch_sub(1, Ordering::SeqCst);
                }
                if let Some(new) = new_list {
                    new.len.fetch_add(1, Ordering::SeqCst);
                }
            }

            prev_g.next = Some(next.clone());
            next_g.prev = Some(Arc::downgrade(&prev));
            e_g.next = None;
            e_g.prev = None;
            e_g.list = new_list.map(Arc::downgrade);
            return true;
        }
    }

    /// Walks the list and verifies link symmetry, list pointers, and the
    /// length counter. Only meaningful after
    /// [`LruList::wait_for_insertions`] while no mutator is running.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        if self.shared.pending.load(Ordering::SeqCst) != 0 {
            return Err(InvariantError::new("pending insertions outstanding"));
        }
        let recorded = self.shared.len.load(Ordering::SeqCst);
        let mut count = 0i64;
        let mut prev = self.shared.head.clone();
        let mut cur = self
            .shared
            .head
            .links
            .lock()
            .next
            .clone()
            .ok_or_else(|| InvariantError::new("head sentinel has no successor"))?;
        while !Arc::ptr_eq(&cur, &self.shared.tail) {
            let next = {
                let g = cur.links.lock();
                let back = g
                    .prev
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| InvariantError::new("linked node has no predecessor"))?;
                if !Arc::ptr_eq(&back, &prev) {
                    return Err(InvariantError::new("broken back link"));
                }
                if !g.belongs_to(&self.shared) {
                    return Err(InvariantError::new("node does not point at its list"));
                }
                g.next
                    .clone()
                    .ok_or_else(|| InvariantError::new("linked node has no successor"))?
            };
            prev = cur;
            cur = next;
            count += 1;
            if count > recorded {
                return Err(InvariantError::new("walk exceeds recorded length"));
            }
        }
        let tail_back = self
            .shared
            .tail
            .links
            .lock()
            .prev
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| InvariantError::new("tail sentinel has no predecessor"))?;
        if !Arc::ptr_eq(&tail_back, &prev) {
            return Err(InvariantError::new("tail back link does not close the walk"));
        }
        if count != recorded {
            return Err(InvariantError::new("list length mismatch"));
        }
        Ok(())
    }
}

impl<T> fmt::Debug for LruList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruList")
            .field("len", &self.len())
            .field("pending_insertions", &self.pending_insertions())
            .finish()
    }
}

impl<T> Drop for LruList<T> {
    fn drop(&mut self) {
        self.close();
        // break the forward chain iteratively so long lists do not recurse
        let mut cur = self.shared.head.links.lock().next.take();
        while let Some(node) = cur {
            cur = node.links.lock().next.take();
        }
    }
}
