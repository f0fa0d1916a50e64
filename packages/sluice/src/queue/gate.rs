// ordered gate: a single-priority queue which releases items strictly in increasing order of a
// caller-defined key, holding back items that arrive ahead of their turn.

use super::{
    api::{
        future::{Deactivated, DequeueFut},
        AsyncQueue,
        Builder,
    },
    core::{Deferred, Lockable},
    discipline::{Discipline, ItemLists},
    error::*,
    operation::DequeueOperation,
};
use std::{
    cmp::Ordering,
    fmt::Debug,
};
use tokio::sync::oneshot;


/// Item which can pass through an [`OrderedGate`]
///
/// An item's key says where it goes in the sequence, and its successor key says which key the
/// gate expects next once it has been released. The successor must be greater than the key. A
/// byte range, for example, is keyed by its offset and succeeded by its end.
pub trait Ordered {
    /// Position of an item in the sequence
    type Key: Ord + Clone + Debug + Send + 'static;

    /// Key of this item
    fn order_key(&self) -> Self::Key;

    /// Key expected next once this item has been released
    fn next_order_key(&self) -> Self::Key;
}

/// [`Discipline`] of an [`OrderedGate`]: releases the queued item with the lowest key, but only
/// once it equals the next expected key
#[derive(Debug, Clone)]
pub struct OrderedDiscipline<K> {
    // unset until first activation.
    next: Option<K>,
}

impl<K> OrderedDiscipline<K> {
    fn new() -> Self {
        OrderedDiscipline { next: None }
    }

    /// Key expected next, if it was ever set
    pub fn next_key(&self) -> Option<&K> {
        self.next.as_ref()
    }
}

impl<K: Ord + Debug> OrderedDiscipline<K> {
    // move the expected key past a released item.
    //
    // panics if the item's successor does not advance the expected key.
    fn advance<T: Ordered<Key = K>>(&mut self, item: &T) {
        let successor = item.next_order_key();
        if let Some(next) = &self.next {
            assert!(
                successor > *next,
                "ordered item successor key {:?} does not advance past {:?}",
                successor,
                next,
            );
        }
        self.next = Some(successor);
    }
}

impl<T: Ordered> Discipline<T> for OrderedDiscipline<T::Key> {
    fn take_next(&mut self, lists: &mut ItemLists<T>) -> Option<(T, usize)> {
        let next = self.next.as_ref()?;
        if lists.front(0)?.order_key() != *next {
            return None;
        }
        let item = lists.pop_front(0)?;
        self.advance(&item);
        Some((item, 0))
    }

    fn on_restored(&mut self, item: &T, _: usize) {
        // released items all precede the queued ones, so it becomes next again
        self.next = Some(item.order_key());
    }
}

/// [`DequeueOperation`] of an [`OrderedGate`]
pub type OrderedDequeueOperation<T> = DequeueOperation<T, OrderedDiscipline<<T as Ordered>::Key>>;

/// [`DequeueFut`] of an [`OrderedGate`]
pub type OrderedDequeueFut<T> = DequeueFut<T, OrderedDiscipline<<T as Ordered>::Key>>;


/// Queue which releases items strictly in increasing key order
///
/// Items are enqueued in any order with [`enqueue_ordered`](Self::enqueue_ordered), and are
/// dequeued one at a time starting from the key the gate was activated with. An item is released
/// only once every key before it in the sequence has been released, so a gap in the sequence
/// holds back everything after it.
///
/// Otherwise behaves like an [`AsyncQueue`] with a single priority, sharing its lifecycle,
/// pausing, and dequeue operations.
pub struct OrderedGate<T: Ordered> {
    queue: AsyncQueue<T, OrderedDiscipline<T::Key>>,
}

impl<T: Ordered> OrderedGate<T> {
    /// Construct an inactive gate
    pub fn new() -> Self {
        Self::from_builder(Builder::new())
            .expect("no capacity to reserve")
    }

    /// Construct an inactive gate with a name and reserved capacity taken from a builder
    ///
    /// The builder's priority count and discipline are ignored.
    pub fn from_builder<D>(builder: Builder<D>) -> Result<Self, InsufficientResourcesError> {
        builder
            .priorities(1)
            .discipline(OrderedDiscipline::new())
            .build()
            .map(|queue| OrderedGate { queue })
    }

    /// Activate the gate expecting `initial` as the first key, returning a future that resolves
    /// once this activation has fully deactivated
    pub fn activate(&self, initial: T::Key) -> Result<Deactivated, ActivateError> {
        let (send, recv) = oneshot::channel();
        self.activate_with(initial, move || {
            let _ = send.send(());
        })?;
        Ok(Deactivated::new(recv))
    }

    /// Activate the gate expecting `initial` as the first key, calling `on_complete` once this
    /// activation has fully deactivated
    pub fn activate_with<F>(&self, initial: T::Key, on_complete: F) -> Result<(), ActivateError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut lock = self.queue.queue.lock();
        lock.activate(Box::new(on_complete))?;
        let state = lock.state();
        trace!(queue = state.name(), next = ?initial, "ordered gate expecting key");
        state.discipline_mut().next = Some(initial);
        Ok(())
    }

    /// Begin shutdown, leaving queued items to be drained by dequeue operations
    ///
    /// See [`AsyncQueue::deactivate`].
    pub fn deactivate(&self) -> Result<(), ShutdownPendingError> {
        self.queue.deactivate()
    }

    /// Begin shutdown, handing every queued item to `dropped` in key order
    ///
    /// See [`AsyncQueue::deactivate_dropping`].
    pub fn deactivate_dropping<F>(&self, mut dropped: F) -> Result<(), ShutdownPendingError>
    where
        F: FnMut(&Self, T),
    {
        let mut dropped = |item| dropped(self, item);
        self.queue.queue.deactivate(Some(&mut dropped))
    }

    /// Enqueue an item, or hand it directly to a waiting dequeue operation if it is next in
    /// sequence
    ///
    /// Errors, giving back the item, if the gate is not active, if the item's key precedes the
    /// next expected key, or if an item with the same key is already queued.
    pub fn enqueue_ordered(&self, item: T) -> Result<(), EnqueueOrderedError<T>> {
        let mut lock = self.queue.queue.lock();
        let (state, deferred) = lock.parts();
        if enqueue_ordered(state, deferred, item)? {
            // items queued behind it may have become next in sequence
            lock.release_ready();
        }
        Ok(())
    }

    /// Change the next expected key
    ///
    /// Panics if any items are queued.
    pub fn set_next_key(&self, key: T::Key) {
        let mut lock = self.queue.queue.lock();
        let state = lock.state();
        assert!(state.lists().is_empty(), "next key of ordered gate set while items are queued");
        trace!(queue = state.name(), next = ?key, "ordered gate expecting key");
        state.discipline_mut().next = Some(key);
    }

    /// Next expected key, unless the gate was never activated
    pub fn next_key(&self) -> Option<T::Key> {
        self.queue.queue.lock().state().discipline().next_key().cloned()
    }

    /// Remove every queued item, handing each to `dropped` in key order
    ///
    /// See [`AsyncQueue::cancel_all_enqueued`].
    pub fn cancel_all_enqueued<F>(&self, mut dropped: F) -> Result<usize, NotStartedError>
    where
        F: FnMut(&Self, T),
    {
        let mut dropped = |item| dropped(self, item);
        self.queue.queue.cancel_all_enqueued(&mut dropped)
    }

    /// Stop releasing items until [`resume_dequeue`](Self::resume_dequeue)
    pub fn pause_dequeue(&self) {
        self.queue.pause_dequeue();
    }

    /// Resume releasing items to waiting dequeue operations
    pub fn resume_dequeue(&self) {
        self.queue.resume_dequeue();
    }

    /// Create a dequeue operation bound to the current activation
    pub fn create_dequeue_operation(&self) -> OrderedDequeueOperation<T> {
        self.queue.create_dequeue_operation()
    }

    /// Create a future to dequeue the next item in sequence
    pub fn dequeue(&self) -> OrderedDequeueFut<T> {
        self.queue.dequeue()
    }

    /// Number of items queued, whether or not they are next in sequence
    pub fn queued_len(&self) -> usize {
        self.queue.queued_len()
    }

    /// Number of dequeue operations waiting for an item
    pub fn waiter_count(&self) -> usize {
        self.queue.waiter_count()
    }

    /// Version of the current or next activation
    pub fn version(&self) -> u64 {
        self.queue.version()
    }

    /// Whether the gate is active
    pub fn is_active(&self) -> bool {
        self.queue.is_active()
    }

    /// Whether the current activation has completed, or there was none
    pub fn is_deactivated(&self) -> bool {
        self.queue.is_deactivated()
    }

    /// Whether dequeueing is paused
    pub fn is_dequeue_paused(&self) -> bool {
        self.queue.is_dequeue_paused()
    }
}

impl<T: Ordered> Default for OrderedGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ordered> Clone for OrderedGate<T> {
    fn clone(&self) -> Self {
        OrderedGate { queue: self.queue.clone() }
    }
}

impl<T: Ordered> Debug for OrderedGate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("OrderedGate")
            .field("next_key", &self.next_key())
            .field("queue", &self.queue)
            .finish()
    }
}

// enqueue under the lock. returns true if the item was handed directly to a waiter.
fn enqueue_ordered<T: Ordered>(
    state: &mut Lockable<T, OrderedDiscipline<T::Key>>,
    deferred: &mut Deferred<T, OrderedDiscipline<T::Key>>,
    item: T,
) -> Result<bool, EnqueueOrderedError<T>> {
    if !state.is_active() {
        return Err(EnqueueOrderedError { item, cause: ShutdownPendingError.into() });
    }
    let key = item.order_key();
    let next = state.discipline()
        .next_key()
        .cloned()
        .expect("active ordered gate has no next key (internal bug)");

    match key.cmp(&next) {
        Ordering::Less => return Err(EnqueueOrderedError { item, cause: KeyTooLowError.into() }),
        Ordering::Equal => if let Some(waiter) = state.pop_waiter() {
            state.discipline_mut().advance(&item);
            state.dispatch(waiter, item, 0, deferred);
            return Ok(true);
        },
        Ordering::Greater => (),
    }

    // the list is sorted ascending. most items arrive close to in order, so search from the back.
    let list = &state.lists().lists[0];
    let mut anchor = list.back_key();
    while let Some(node) = anchor {
        let queued = list.get(node).expect("walked to unlinked node (internal bug)").order_key();
        match queued.cmp(&key) {
            Ordering::Less => break,
            Ordering::Equal =>
                return Err(EnqueueOrderedError { item, cause: DuplicateKeyError.into() }),
            Ordering::Greater => anchor = list.to_front(node),
        }
    }
    state.insert_item_with(0, item, |list, item| match anchor {
        Some(node) => list.insert_after(node, item),
        None => list.push_front(item),
    });
    Ok(false)
}
