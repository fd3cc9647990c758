//! Doubly linked list safe for concurrent use, locking only the nodes an
//! operation touches.
//!
//! The list is bounded by two sentinel nodes so every data node always has a
//! real predecessor and successor. Mutations lock at most three adjacent
//! nodes; disjoint regions of the list can be modified in parallel.
//!
//! ## Architecture
//!
//! ```text
//!   LinkedList<T>
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ head ──► [a] ──► [b] ──► [c] ──► tail          (next: Arc)   │
//!   │ head ◄── [a] ◄── [b] ◄── [c] ◄── tail          (prev: Weak)  │
//!   │                                                              │
//!   │ len: AtomicI64          every node: RwLock over its links    │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking protocol
//!
//! Locks are always acquired in head-to-tail order: predecessor, then node,
//! then successor. Operations on the head and tail regions therefore cannot
//! deadlock against each other.
//!
//! Because a node's predecessor can change while waiting for its lock,
//! operations that need it run a retry loop: read the node's `prev` snapshot,
//! release the node, write-lock the candidate, and keep it only if its `next`
//! still points at the node. The loop ends when the true predecessor is held
//! or the node has left the list.
//!
//! ## Contracts
//!
//! - `len` is an O(1) atomic load.
//! - Operations on elements that are not members of the list are silent
//!   no-ops (`None`/`false` where a result is expected).
//! - `push_front_list`/`push_back_list` copy the source first and splice the
//!   copy in afterwards, so a list may be appended to itself.
//! - Iteration via [`Element::next`]/[`Element::prev`] is safe during
//!   concurrent mutation and reflects some recent state of the links.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

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
    links: RwLock<Links<T>>,
}

impl<T> Node<T> {
    fn detached(value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            links: RwLock::new(Links {
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
}

/// Handle to one element of a [`LinkedList`]. Cheap to clone; identity is
/// pointer identity ([`Element::ptr_eq`]).
pub struct Element<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Element<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> Element<T> {
    /// Returns the next element, or `None` at the back of the list or when
    /// this element is detached.
    pub fn next(&self) -> Option<Element<T>> {
        let g = self.node.links.read();
        let list = g.list.as_ref()?.upgrade()?;
        let next = g.next.clone()?;
        if Arc::ptr_eq(&next, &list.tail) {
            None
        } else {
            Some(Element { node: next })
        }
    }

    /// Returns the previous element, or `None` at the front of the list or
    /// when this element is detached.
    pub fn prev(&self) -> Option<Element<T>> {
        let g = self.node.links.read();
        let list = g.list.as_ref()?.upgrade()?;
        let prev = g.prev.as_ref()?.upgrade()?;
        if Arc::ptr_eq(&prev, &list.head) {
            None
        } else {
            Some(Element { node: prev })
        }
    }

    /// Runs `f` on a shared reference to the value. Returns `None` once the
    /// value has been taken by [`LinkedList::remove`].
    pub fn value_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.node.links.read().value.as_ref().map(f)
    }

    /// Returns a clone of the value, if still present.
    pub fn value_cloned(&self) -> Option<T>
    where
        T: Clone,
    {
        self.node.links.read().value.clone()
    }

    /// Returns `true` if both handles refer to the same element.
    pub fn ptr_eq(&self, other: &Element<T>) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl<T> fmt::Debug for Element<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("node", &Arc::as_ptr(&self.node))
            .finish()
    }
}

/// Doubly linked list with per-node locking. All operations take `&self` and
/// are safe to call from many threads at once.
pub struct LinkedList<T> {
    shared: Arc<Shared<T>>,
}

impl<T> LinkedList<T> {
    /// Creates an empty list.
    pub fn new() -> Self {
        let head = Node::detached(None);
        let tail = Node::detached(None);
        let shared = Arc::new(Shared {
            head: head.clone(),
            tail: tail.clone(),
            len: AtomicI64::new(0),
        });
        {
            let mut head_g = head.links.write();
            head_g.next = Some(tail.clone());
            head_g.list = Some(Arc::downgrade(&shared));
        }
        {
            let mut tail_g = tail.links.write();
            tail_g.prev = Some(Arc::downgrade(&head));
            tail_g.list = Some(Arc::downgrade(&shared));
        }
        Self { shared }
    }

    /// Returns the number of elements. O(1).
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst).max(0) as usize
    }

    /// Returns `true` if the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the first element, or `None` if the list is empty.
    pub fn front(&self) -> Option<Element<T>> {
        if self.len() == 0 {
            return None;
        }
        let head_g = self.shared.head.links.read();
        // recheck under the sentinel lock
        if self.shared.len.load(Ordering::SeqCst) <= 0 {
            return None;
        }
        let next = head_g.next.clone()?;
        if Arc::ptr_eq(&next, &self.shared.tail) {
            None
        } else {
            Some(Element { node: next })
        }
    }

    /// Returns the last element, or `None` if the list is empty.
    pub fn back(&self) -> Option<Element<T>> {
        if self.len() == 0 {
            return None;
        }
        let tail_g = self.shared.tail.links.read();
        // recheck under the sentinel lock
        if self.shared.len.load(Ordering::SeqCst) <= 0 {
            return None;
        }
        let prev = tail_g.prev.as_ref()?.upgrade()?;
        if Arc::ptr_eq(&prev, &self.shared.head) {
            None
        } else {
            Some(Element { node: prev })
        }
    }

    /// Inserts `value` at the front and returns its element.
    pub fn push_front(&self, value: T) -> Element<T> {
        let node = Node::detached(Some(value));
        // sentinels are permanent members, so this cannot fail
        self.link_after(&node, &self.shared.head);
        Element { node }
    }

    /// Inserts `value` at the back and returns its element.
    pub fn push_back(&self, value: T) -> Element<T> {
        let node = Node::detached(Some(value));
        self.link_before(&node, &self.shared.tail);
        Element { node }
    }

    /// Inserts `value` immediately after `mark`. Returns `None` without
    /// modifying the list if `mark` is not a member.
    pub fn insert_after(&self, value: T, mark: &Element<T>) -> Option<Element<T>> {
        let node = Node::detached(Some(value));
        if self.link_after(&node, &mark.node) {
            Some(Element { node })
        } else {
            None
        }
    }

    /// Inserts `value` immediately before `mark`. Returns `None` without
    /// modifying the list if `mark` is not a member.
    pub fn insert_before(&self, value: T, mark: &Element<T>) -> Option<Element<T>> {
        let node = Node::detached(Some(value));
        if self.link_before(&node, &mark.node) {
            Some(Element { node })
        } else {
            None
        }
    }

    /// Removes `e` and returns its value, or `None` if `e` was not a member
    /// of this list when the call observed it.
    pub fn remove(&self, e: &Element<T>) -> Option<T> {
        if self.unlink(&e.node) {
            e.node.links.write().value.take()
        } else {
            None
        }
    }

    /// Moves `e` to the front. Returns `true` if `e` ends up at the front
    /// (including when it already was).
    pub fn move_to_front(&self, e: &Element<T>) -> bool {
        self.move_node_after(&e.node, &self.shared.head)
    }

    /// Moves `e` to the back. Returns `true` if `e` ends up at the back
    /// (including when it already was).
    pub fn move_to_back(&self, e: &Element<T>) -> bool {
        self.move_node_before(&e.node, &self.shared.tail)
    }

    /// Moves `e` immediately after `mark`. No-op returning `false` when
    /// `e == mark` or either is not a member.
    pub fn move_after(&self, e: &Element<T>, mark: &Element<T>) -> bool {
        if e.ptr_eq(mark) {
            return false;
        }
        self.move_node_after(&e.node, &mark.node)
    }

    /// Moves `e` immediately before `mark`. No-op returning `false` when
    /// `e == mark` or either is not a member.
    pub fn move_before(&self, e: &Element<T>, mark: &Element<T>) -> bool {
        if e.ptr_eq(mark) {
            return false;
        }
        self.move_node_before(&e.node, &mark.node)
    }

    /// Appends a copy of `other`'s current contents. The copy is taken
    /// first, so `self` and `other` may be the same list.
    pub fn push_back_list(&self, other: &LinkedList<T>)
    where
        T: Clone,
    {
        if let Some((first, last, count)) = Self::copy_chain(other) {
            self.splice_before(&first, &last, count, &self.shared.tail);
        }
    }

    /// Prepends a copy of `other`'s current contents. The copy is taken
    /// first, so `self` and `other` may be the same list.
    pub fn push_front_list(&self, other: &LinkedList<T>)
    where
        T: Clone,
    {
        if let Some((first, last, count)) = Self::copy_chain(other) {
            self.splice_after(&first, &last, count, &self.shared.head);
        }
    }

    /// Removes every element.
    pub fn clear(&self) {
        while let Some(e) = self.front() {
            let _ = self.remove(&e);
        }
    }

    /// Returns a front-to-back iterator over element handles. Best effort
    /// under concurrent mutation.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            next: self.front(),
        }
    }

    // -- internal primitives ----------------------------------------------

    /// Links a detached node immediately after `at`. Locks `at`, the new
    /// node, and `at`'s successor, in that order. Fails if `at` is not in
    /// this list.
    fn link_after(&self, node: &Arc<Node<T>>, at: &Arc<Node<T>>) -> bool {
        let mut at_g = at.links.write();
        if !at_g.belongs_to(&self.shared) {
            return false;
        }
        let next = match at_g.next.clone() {
            Some(n) => n,
            None => return false,
        };
        let mut node_g = node.links.write();
        let mut next_g = next.links.write();

        node_g.list = Some(Arc::downgrade(&self.shared));
        node_g.prev = Some(Arc::downgrade(at));
        node_g.next = Some(next.clone());
        at_g.next = Some(node.clone());
        next_g.prev = Some(Arc::downgrade(node));
        self.shared.len.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Links a detached node immediately before `at`, holding `at`'s true
    /// predecessor for the splice. Fails if `at` leaves the list first.
    fn link_before(&self, node: &Arc<Node<T>>, at: &Arc<Node<T>>) -> bool {
        loop {
            let prev = {
                let at_g = at.links.read();
                if !at_g.belongs_to(&self.shared) {
                    return false;
                }
                match at_g.prev.as_ref().and_then(Weak::upgrade) {
                    Some(p) => p,
                    None => return false,
                }
            };
            let mut prev_g = prev.links.write();
            if !prev_g.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, at)) {
                // at got a new predecessor before we got the lock, try again
                continue;
            }
            let mut node_g = node.links.write();
            let mut at_g = at.links.write();

            node_g.list = Some(Arc::downgrade(&self.shared));
            node_g.prev = Some(Arc::downgrade(&prev));
            node_g.next = Some(at.clone());
            prev_g.next = Some(node.clone());
            at_g.prev = Some(Arc::downgrade(node));
            self.shared.len.fetch_add(1, Ordering::SeqCst);
            return true;
        }
    }

    /// Unlinks `e` from this list, clearing its links and list pointer.
    /// Returns `false` if `e` was not a member or lost membership during the
    /// retry.
    fn unlink(&self, e: &Arc<Node<T>>) -> bool {
        loop {
            let prev = {
                let e_g = e.links.read();
                if !e_g.belongs_to(&self.shared) {
                    return false;
                }
                match e_g.prev.as_ref().and_then(Weak::upgrade) {
                    Some(p) => p,
                    None => return false,
                }
            };
            let mut prev_g = prev.links.write();
            if !prev_g.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, e)) {
                // e got a new predecessor before we got the lock, try again
                continue;
            }
            let mut e_g = e.links.write();
            let next = match e_g.next.clone() {
                Some(n) => n,
                None => return false,
            };
            let mut next_g = next.links.write();

            self.shared.len.fetch_sub(1, Ordering::SeqCst);
            prev_g.next = Some(next.clone());
            next_g.prev = Some(Arc::downgrade(&prev));
            e_g.next = None;
            e_g.prev = None;
            e_g.list = None;
            return true;
        }
    }

    fn move_node_after(&self, e: &Arc<Node<T>>, at: &Arc<Node<T>>) -> bool {
        if Arc::ptr_eq(e, at) {
            return true;
        }
        {
            let at_g = at.links.read();
            if !at_g.belongs_to(&self.shared) {
                return false;
            }
            // already in the requested position
            if at_g.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, e)) {
                return true;
            }
        }
        if !self.unlink(e) {
            return false;
        }
        // if at left the list while e was detached, e stays out
        self.link_after(e, at)
    }

    fn move_node_before(&self, e: &Arc<Node<T>>, at: &Arc<Node<T>>) -> bool {
        if Arc::ptr_eq(e, at) {
            return true;
        }
        {
            let at_g = at.links.read();
            if !at_g.belongs_to(&self.shared) {
                return false;
            }
            // already in the requested position
            if at_g
                .prev
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|p| Arc::ptr_eq(&p, e))
            {
                return true;
            }
        }
        if !self.unlink(e) {
            return false;
        }
        // if at left the list while e was detached, e stays out
        self.link_before(e, at)
    }

    /// Builds a detached chain holding clones of `other`'s current values.
    /// The walk is bounded by the length observed at entry.
    fn copy_chain(other: &LinkedList<T>) -> Option<(Arc<Node<T>>, Arc<Node<T>>, i64)>
    where
        T: Clone,
    {
        let mut first: Option<Arc<Node<T>>> = None;
        let mut last: Option<Arc<Node<T>>> = None;
        let mut count = 0i64;
        let mut remaining = other.len();
        let mut cur = other.front();
        while remaining > 0 {
            let Some(e) = cur else { break };
            if let Some(value) = e.value_cloned() {
                let node = Node::detached(Some(value));
                match last.take() {
                    Some(prev_node) => {
                        prev_node.links.write().next = Some(node.clone());
                        node.links.write().prev = Some(Arc::downgrade(&prev_node));
                        last = Some(node);
                    }
                    None => {
                        first = Some(node.clone());
                        last = Some(node);
                    }
                }
                count += 1;
            }
            remaining -= 1;
            cur = e.next();
        }
        match (first, last) {
            (Some(f), Some(l)) => Some((f, l, count)),
            _ => None,
        }
    }

    /// Marks every node of a detached chain as belonging to this list. The
    /// chain is unshared, so no locks beyond each node's own are needed.
    fn adopt_chain(&self, first: &Arc<Node<T>>, last: &Arc<Node<T>>) {
        let mut cur = first.clone();
        loop {
            let next = {
                let mut g = cur.links.write();
                g.list = Some(Arc::downgrade(&self.shared));
                g.next.clone()
            };
            if Arc::ptr_eq(&cur, last) {
                break;
            }
            match next {
                Some(n) => cur = n,
                None => break,
            }
        }
    }

    /// Splices a detached chain in immediately after `at` with a single
    /// three-lock window.
    fn splice_after(
        &self,
        first: &Arc<Node<T>>,
        last: &Arc<Node<T>>,
        count: i64,
        at: &Arc<Node<T>>,
    ) -> bool {
        self.adopt_chain(first, last);

        let mut at_g = at.links.write();
        if !at_g.belongs_to(&self.shared) {
            return false;
        }
        let next = match at_g.next.clone() {
            Some(n) => n,
            None => return false,
        };
        let mut first_g = first.links.write();
        let mut last_g = if Arc::ptr_eq(first, last) {
            None
        } else {
            Some(last.links.write())
        };
        let mut next_g = next.links.write();

        first_g.prev = Some(Arc::downgrade(at));
        match last_g.as_mut() {
            Some(lg) => lg.next = Some(next.clone()),
            None => first_g.next = Some(next.clone()),
        }
        at_g.next = Some(first.clone());
        next_g.prev = Some(Arc::downgrade(last));
        self.shared.len.fetch_add(count, Ordering::SeqCst);
        true
    }

    /// Splices a detached chain in immediately before `at`, holding `at`'s
    /// true predecessor for the splice.
    fn splice_before(
        &self,
        first: &Arc<Node<T>>,
        last: &Arc<Node<T>>,
        count: i64,
        at: &Arc<Node<T>>,
    ) -> bool {
        self.adopt_chain(first, last);

        loop {
            let prev = {
                let at_g = at.links.read();
                if !at_g.belongs_to(&self.shared) {
                    return false;
                }
                match at_g.prev.as_ref().and_then(Weak::upgrade) {
                    Some(p) => p,
                    None => return false,
                }
            };
            let mut prev_g = prev.links.write();
            if !prev_g.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, at)) {
                // at got a new predecessor before we got the lock, try again
                continue;
            }
            let mut first_g = first.links.write();
            let mut last_g = if Arc::ptr_eq(first, last) {
                None
            } else {
                Some(last.links.write())
            };
            let mut at_g = at.links.write();

            first_g.prev = Some(Arc::downgrade(&prev));
            match last_g.as_mut() {
                Some(lg) => lg.next = Some(at.clone()),
                None => first_g.next = Some(at.clone()),
            }
            prev_g.next = Some(first.clone());
            at_g.prev = Some(Arc::downgrade(last));
            self.shared.len.fetch_add(count, Ordering::SeqCst);
            return true;
        }
    }

    /// Walks the list and verifies link symmetry, list pointers, and the
    /// length counter. Only meaningful while no mutator is running.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let recorded = self.shared.len.load(Ordering::SeqCst);
        let mut count = 0i64;
        let mut prev = self.shared.head.clone();
        let mut cur = self
            .shared
            .head
            .links
            .read()
            .next
            .clone()
            .ok_or_else(|| InvariantError::new("head sentinel has no successor"))?;
        while !Arc::ptr_eq(&cur, &self.shared.tail) {
            let next = {
                let g = cur.links.read();
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
            .read()
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

impl<T> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LinkedList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedList").field("len", &self.len()).finish()
    }
}

impl<T> Drop for LinkedList<T> {
    fn drop(&mut self) {
        // break the forward chain iteratively so long lists do not recurse
        let mut cur = self.shared.head.links.write().next.take();
        while let Some(node) = cur {
            cur = node.links.write().next.take();
        }
    }
}

/// Front-to-back iterator over element handles.
pub struct Iter<T> {
    next: Option<Element<T>>,
}

impl<T> Iterator for Iter<T> {
    type Item = Element<T>;

    fn next(&mut self) -> Option<Element<T>> {
        let cur = self.next.take()?;
        self.next = cur.next();
        Some(cur)
    }
}
