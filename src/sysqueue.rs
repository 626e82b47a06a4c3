//! # System Queue
//!
//! A bounded, array-backed delay queue. Each node carries an opaque handle,
//! a tick counter and an auxiliary `ext` word. Nodes are kept contiguous
//! and ordered by counter, so the front of the array is always the next node
//! to come due.
//!
//! ```text
//!   slots:  [ top | follower | ... | len-1 | free | free ]
//!             ▲ smallest counter            ▲ numfree() slots
//! ```
//!
//! Two insertion disciplines share the one array:
//!
//! - [`SysQueue::new_node`]: binary insertion by a caller comparator. Equal
//!   keys land after existing ones.
//! - [`SysQueue::extend`]: linear scan that appends after the last node
//!   matching a predicate, so a run of related nodes stays in insertion order.
//!   The new node is never due before the node it follows.
//!
//! Clocking decrements every counter uniformly (saturating at 0), which
//! never reorders the queue. The queue never looks inside a handle.

use core::cmp::Ordering;
use core::fmt;

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::boxed::Box;

/// Errors raised when binding or filling a System Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The backing storage has no slots.
    ZeroCapacity,
    /// Every slot is occupied.
    Full,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::ZeroCapacity => f.write_str("system queue has zero capacity"),
            QueueError::Full => f.write_str("system queue is full"),
        }
    }
}

/// One queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueNode<H> {
    /// Caller-owned value; never dereferenced or freed by the queue.
    pub handle: H,
    /// Ticks until due. Never negative.
    pub counter: u16,
    /// Auxiliary payload: flags, a tag, or the low half of a 32-bit counter.
    pub ext: u16,
}

impl<H> QueueNode<H> {
    pub const fn new(handle: H, counter: u16, ext: u16) -> Self {
        Self { handle, counter, ext }
    }

    /// Node whose 32-bit due time is split across `counter` (high half)
    /// and `ext` (low half).
    pub const fn with_long_counter(handle: H, ticks: u32) -> Self {
        Self {
            handle,
            counter: (ticks >> 16) as u16,
            ext: ticks as u16,
        }
    }

    /// The composed 32-bit counter.
    #[inline]
    pub const fn long_counter(&self) -> u32 {
        ((self.counter as u32) << 16) | self.ext as u32
    }
}

/// Backing storage for a queue.
enum Backing<'a, H> {
    Borrowed(&'a mut [Option<QueueNode<H>>]),
    #[cfg(feature = "alloc")]
    Owned(Box<[Option<QueueNode<H>>]>),
}

/// Bounded sorted delay queue. See the module documentation.
pub struct SysQueue<'a, H> {
    heap: Backing<'a, H>,
    length: usize,
}

impl<'a, H: Copy> SysQueue<'a, H> {
    /// Bind a queue to caller-owned storage. Existing slot contents are
    /// discarded. Fails only when `storage` is empty.
    pub fn init(storage: &'a mut [Option<QueueNode<H>>]) -> Result<Self, QueueError> {
        if storage.is_empty() {
            return Err(QueueError::ZeroCapacity);
        }
        storage.iter_mut().for_each(|slot| *slot = None);
        Ok(Self {
            heap: Backing::Borrowed(storage),
            length: 0,
        })
    }

    /// Allocate backing storage for `capacity` nodes on the heap.
    #[cfg(feature = "alloc")]
    pub fn with_capacity(capacity: usize) -> Result<SysQueue<'static, H>, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let slots: Box<[Option<QueueNode<H>>]> = (0..capacity).map(|_| None).collect();
        Ok(SysQueue {
            heap: Backing::Owned(slots),
            length: 0,
        })
    }

    #[inline]
    fn slots(&self) -> &[Option<QueueNode<H>>] {
        match &self.heap {
            Backing::Borrowed(s) => &s[..],
            #[cfg(feature = "alloc")]
            Backing::Owned(s) => &s[..],
        }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [Option<QueueNode<H>>] {
        match &mut self.heap {
            Backing::Borrowed(s) => &mut s[..],
            #[cfg(feature = "alloc")]
            Backing::Owned(s) => &mut s[..],
        }
    }

    /// Node at queue position `i`. Positions below `length` are always filled.
    #[inline]
    fn at(&self, i: usize) -> Option<&QueueNode<H>> {
        if i < self.length {
            self.slots()[i].as_ref()
        } else {
            None
        }
    }

    /// Shift `[pos, length)` up one slot and place `node` at `pos`.
    fn insert_at(&mut self, pos: usize, node: QueueNode<H>) -> &mut QueueNode<H> {
        let length = self.length;
        self.length += 1;
        let slots = self.slots_mut();
        slots[pos..=length].rotate_right(1);
        slots[pos].insert(node)
    }

    /// Binary-insertion-sorted insert.
    ///
    /// `compare(new, existing)` orders the new node against queued nodes; the
    /// node is placed after every node that does not compare greater. Returns
    /// the inserted node, or `None` (queue unchanged) if the queue is full.
    pub fn new_node<F>(&mut self, node: QueueNode<H>, compare: F) -> Option<&mut QueueNode<H>>
    where
        F: Fn(&QueueNode<H>, &QueueNode<H>) -> Ordering,
    {
        if self.length == self.capacity() {
            log::warn!("sysqueue: insert rejected, {} of {} slots used", self.length, self.capacity());
            return None;
        }
        let (mut lo, mut hi) = (0, self.length);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.at(mid) {
                Some(existing) if compare(&node, existing) != Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        log::trace!("sysqueue: insert counter {} at {}", node.counter, lo);
        Some(self.insert_at(lo, node))
    }

    /// Sorted insert by counter. Shorthand for `new_node` with a counter
    /// comparator.
    pub fn push(&mut self, node: QueueNode<H>) -> Option<&mut QueueNode<H>> {
        self.new_node(node, |a, b| a.counter.cmp(&b.counter))
    }

    /// Sequence-preserving insert.
    ///
    /// Scans from the front and places `node` immediately after the last
    /// node for which `predicate` holds, and never ahead of a node with a
    /// smaller counter. If the node ends up behind a node that is due later,
    /// its counter is raised to match so it still fires after its
    /// predecessor. Returns `None` (queue unchanged) if the queue is full.
    pub fn extend<P>(&mut self, mut node: QueueNode<H>, predicate: P) -> Option<&mut QueueNode<H>>
    where
        P: Fn(&QueueNode<H>) -> bool,
    {
        if self.length == self.capacity() {
            log::warn!("sysqueue: extend rejected, {} of {} slots used", self.length, self.capacity());
            return None;
        }
        let mut pos = 0;
        for i in 0..self.length {
            match self.at(i) {
                Some(existing) if predicate(existing) || existing.counter <= node.counter => pos = i + 1,
                _ => {}
            }
        }
        if let Some(prev) = pos.checked_sub(1).and_then(|p| self.at(p)) {
            node.counter = node.counter.max(prev.counter);
        }
        log::trace!("sysqueue: extend counter {} at {}", node.counter, pos);
        Some(self.insert_at(pos, node))
    }

    /// Subtract `ticks` from every counter, floored at 0. Returns the new top
    /// counter, or `None` if the queue is empty.
    pub fn clock(&mut self, ticks: u32) -> Option<u16> {
        let dec = ticks.min(u16::MAX as u32) as u16;
        let length = self.length;
        self.slots_mut()[..length]
            .iter_mut()
            .flatten()
            .for_each(|n| n.counter = n.counter.saturating_sub(dec));
        self.top().map(|n| n.counter)
    }

    /// Clock nodes whose due time is the composed 32-bit counter
    /// (`counter` high, `ext` low). Returns the new top 32-bit counter.
    pub fn clock_long(&mut self, ticks: u32) -> Option<u32> {
        let length = self.length;
        self.slots_mut()[..length].iter_mut().flatten().for_each(|n| {
            let left = n.long_counter().saturating_sub(ticks);
            n.counter = (left >> 16) as u16;
            n.ext = left as u16;
        });
        self.top().map(QueueNode::long_counter)
    }

    /// Read the top counter, zero it, and return the value it held. A return
    /// of 0 means the top node was already due.
    pub fn activate(&mut self) -> Option<u16> {
        if self.length == 0 {
            return None;
        }
        self.slots_mut()[0].as_mut().map(|n| core::mem::replace(&mut n.counter, 0))
    }

    /// Remove and return the top node.
    pub fn pop(&mut self) -> Option<QueueNode<H>> {
        if self.length == 0 {
            return None;
        }
        let length = self.length;
        let slots = self.slots_mut();
        let node = slots[0].take();
        slots[..length].rotate_left(1);
        self.length -= 1;
        node
    }

    /// Remove every node matching `predicate`, keeping the order of the
    /// rest. Returns the number removed.
    pub fn flush<P>(&mut self, predicate: P) -> usize
    where
        P: Fn(&QueueNode<H>) -> bool,
    {
        let length = self.length;
        let slots = self.slots_mut();
        let mut kept = 0;
        for i in 0..length {
            match slots[i] {
                Some(node) if !predicate(&node) => {
                    slots[kept] = Some(node);
                    kept += 1;
                }
                _ => {}
            }
        }
        slots[kept..length].iter_mut().for_each(|slot| *slot = None);
        self.length = kept;
        length - kept
    }

    /// Drop every node.
    pub fn clear(&mut self) {
        let length = self.length;
        self.slots_mut()[..length].iter_mut().for_each(|slot| *slot = None);
        self.length = 0;
    }

    /// Node that will come due first.
    #[inline]
    pub fn top(&self) -> Option<&QueueNode<H>> {
        self.at(0)
    }

    /// Node that will come due after the top one.
    #[inline]
    pub fn follower(&self) -> Option<&QueueNode<H>> {
        self.at(1)
    }

    /// Queued nodes in due order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueNode<H>> {
        self.slots()[..self.length].iter().flatten()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn notempty(&self) -> bool {
        self.length != 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    #[inline]
    pub fn numfree(&self) -> usize {
        self.capacity() - self.length
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
