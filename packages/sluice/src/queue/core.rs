// minimal API for the queue: shared state, matching, and the activity latch. the exposed API is a
// convenience wrapper around this.

use super::{
    discipline::{Discipline, ItemLists},
    error::*,
    node_queue::{NodeQueue, NodeKey},
    operation::{self, OpShared},
};
use smallvec::SmallVec;
use std::{
    mem::take,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, MutexGuard,
    },
};


// source of queue ids, which scope item keys to the queue that issued them.
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);


// callback fired once the activity count of an activation reaches zero.
pub(crate) type OnComplete = Box<dyn FnOnce() + Send>;

// handle to a queue.
pub(crate) struct Queue<T, D>(Arc<Shared<T, D>>);

// queue shared state.
struct Shared<T, D> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T, D>>,
}

// queue lockable state.
pub(crate) struct Lockable<T, D> {
    // label for tracing events.
    name: &'static str,
    // unique among queues of the process.
    id: u64,
    // queued items, one list per priority.
    lists: ItemLists<T>,
    // posted dequeue operations not yet matched with an item.
    //
    // - only ever non-empty while is_active is true.
    // - every waiter's version equals the current version.
    waiters: NodeQueue<Arc<OpShared<T, D>>>,
    // dequeue strategy and its state.
    discipline: D,
    // true from activation until deactivation begins.
    is_active: bool,
    // while true, items are not matched with waiters.
    is_dequeue_paused: bool,
    // true while a batched release has the lock released between batches. items and waiters
    // arriving meanwhile are queued for it rather than matched directly.
    is_releasing: bool,
    // one for the activation itself, plus one for every item the queue owns. reaching zero ends
    // the activation.
    activity: usize,
    // incremented every time activity reaches zero. starts at 1.
    version: u64,
    // completion of the current activation.
    on_complete: Option<OnComplete>,
}

// work to do once the lock is released.
//
// never grows past its inline capacity: bulk matching is split into batches that fit.
pub(crate) struct Deferred<T, D>(SmallVec<[Action<T, D>; 4]>);

enum Action<T, D> {
    // complete a dequeue operation, with the item's priority on success.
    Complete(Arc<OpShared<T, D>>, Result<(T, usize), DequeueError>),
    // notify that an activation has ended.
    Finished(OnComplete),
}

// identity of an item queued by enqueue.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct ItemKey {
    pub(crate) queue: u64,
    pub(crate) priority: usize,
    pub(crate) node: NodeKey,
    pub(crate) version: u64,
}

impl<T, D: Discipline<T>> Queue<T, D> {
    // construct an inactive queue.
    pub(crate) fn new(
        name: &'static str,
        priorities: usize,
        capacity: usize,
        discipline: D,
    ) -> Result<Self, InsufficientResourcesError> {
        assert!(priorities > 0, "queue must have at least one priority");
        let mut lists = ItemLists::new(priorities);
        let mut waiters = NodeQueue::new();
        for list in lists.lists.iter_mut() {
            list.try_reserve(capacity).map_err(|_| InsufficientResourcesError)?;
        }
        waiters.try_reserve(capacity).map_err(|_| InsufficientResourcesError)?;
        Ok(Queue(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                name,
                id: NEXT_QUEUE_ID.fetch_add(1, Relaxed),
                lists,
                waiters,
                discipline,
                is_active: false,
                is_dequeue_paused: false,
                is_releasing: false,
                activity: 0,
                version: 1,
                on_complete: None,
            }),
        })))
    }

    // deactivate, then resolve waiters and either drop or leave queued items.
    //
    // the steps take and release the lock separately, so that completions and the dropped item
    // callback always run with the lock released.
    pub(crate) fn deactivate(
        &self,
        dropped: Option<&mut dyn FnMut(T)>,
    ) -> Result<(), ShutdownPendingError> {
        let name = {
            let mut lock = self.lock();
            let (state, _) = lock.parts();
            if !state.is_active {
                warn!(queue = state.name, "deactivate called on inactive queue");
                return Err(ShutdownPendingError);
            }
            state.is_active = false;
            trace!(queue = state.name, version = state.version, "deactivating");
            state.name
        };

        // wake up posted waiters, one lock at a time
        let mut resolved = 0usize;
        loop {
            let mut lock = self.lock();
            let (state, deferred) = lock.parts();
            let Some(waiter) = state.waiters.pop_front() else { break };
            deferred.complete(waiter, Err(ShutdownPendingError.into()));
            resolved += 1;
        }
        trace!(queue = name, resolved, "resolved posted waiters");

        let mut lock = self.lock();
        let (state, deferred) = lock.parts();
        // reverse the activation's count. queued items still hold theirs.
        state.release_activity(1, deferred);
        if let Some(dropped) = dropped {
            let count = lock.drop_items(usize::MAX, dropped);
            trace!(queue = name, count, "dropped queued items");
        }
        Ok(())
    }

    // drop all queued items through a callback, holding the activation open meanwhile.
    pub(crate) fn cancel_all_enqueued(
        &self,
        dropped: &mut dyn FnMut(T),
    ) -> Result<usize, NotStartedError> {
        let mut lock = self.lock();
        let state = lock.state();
        if state.activity == 0 {
            warn!(queue = state.name, "cancel_all_enqueued called on queue without activity");
            return Err(NotStartedError);
        }
        // hold the activation open meanwhile. items enqueued after this point are left alone.
        state.activity += 1;
        let limit = state.lists.total_len();
        let count = lock.drop_items(limit, dropped);
        if count > 0 {
            trace!(queue = lock.state().name, count, "cancelled all enqueued items");
        }
        let (state, deferred) = lock.parts();
        state.release_activity(1, deferred);
        Ok(count)
    }
}

impl<T, D> Queue<T, D> {
    // lock the queue.
    pub(crate) fn lock(&self) -> Lock<'_, T, D> {
        Lock {
            queue: self,
            guard: Some(self.0.lockable.lock().unwrap()),
            deferred: Deferred(SmallVec::new()),
        }
    }

    // whether two handles refer to the same queue.
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T, D> Clone for Queue<T, D> {
    fn clone(&self) -> Self {
        Queue(Arc::clone(&self.0))
    }
}

// lock on a queue.
//
// actions deferred while the lock was held run when it drops, after the mutex is released.
pub(crate) struct Lock<'a, T, D> {
    queue: &'a Queue<T, D>,
    guard: Option<MutexGuard<'a, Lockable<T, D>>>,
    deferred: Deferred<T, D>,
}

impl<'a, T, D> Lock<'a, T, D> {
    // borrow the lockable state and the deferred action list.
    pub(crate) fn parts(&mut self) -> (&mut Lockable<T, D>, &mut Deferred<T, D>) {
        let state = self.guard.as_deref_mut().expect("lock used after release (internal bug)");
        (state, &mut self.deferred)
    }

    // borrow the lockable state.
    pub(crate) fn state(&mut self) -> &mut Lockable<T, D> {
        self.parts().0
    }

    // unlink a posted dequeue operation and complete it as cancelled.
    pub(crate) fn cancel_posted_wait(&mut self, op: &Arc<OpShared<T, D>>) {
        let (state, deferred) = self.parts();
        state.cancel_posted_wait(op, deferred);
    }

    // release the mutex to run the deferred actions, then take it again.
    fn flush(&mut self) {
        drop(self.guard.take());
        self.run_deferred();
        self.guard = Some(self.queue.0.lockable.lock().unwrap());
    }

    fn run_deferred(&mut self) {
        for action in take(&mut self.deferred.0) {
            match action {
                Action::Complete(op, outcome) => operation::complete(self.queue, op, outcome),
                Action::Finished(on_complete) => on_complete(),
            }
        }
    }
}

impl<'a, T, D: Discipline<T>> Lock<'a, T, D> {
    // begin an activation.
    pub(crate) fn activate(&mut self, on_complete: OnComplete) -> Result<u64, ActivateError> {
        self.state().activate(on_complete)
    }

    // enqueue or hand directly to a waiter.
    pub(crate) fn enqueue(&mut self, item: T, priority: usize) -> Result<Option<ItemKey>, EnqueueError<T>> {
        let (state, deferred) = self.parts();
        state.enqueue(item, priority, deferred)
    }

    // remove a queued item.
    pub(crate) fn cancel_enqueue(&mut self, key: ItemKey) -> Option<T> {
        let (state, deferred) = self.parts();
        state.cancel_enqueue(key, deferred)
    }

    // post a dequeue operation.
    pub(crate) fn post_wait(&mut self, op: Arc<OpShared<T, D>>) {
        let (state, deferred) = self.parts();
        state.post_wait(op, deferred);
    }

    // pause matching.
    pub(crate) fn pause_dequeue(&mut self) {
        self.state().pause_dequeue();
    }

    // resume matching, pairing up waiters and ready items.
    pub(crate) fn resume_dequeue(&mut self) {
        let state = self.state();
        if !state.is_dequeue_paused {
            return;
        }
        state.is_dequeue_paused = false;
        let matched = self.release_ready();
        let state = self.state();
        trace!(queue = state.name, matched, "dequeue resumed");
        // unless paused again while the lock was released between batches
        if !state.is_dequeue_paused {
            state.discipline.on_resumed();
        }
    }

    // pair waiters with ready items until either runs out. when there are more pairs than fit in
    // the deferred list, the lock is released between batches to complete them.
    pub(crate) fn release_ready(&mut self) -> usize {
        let mut matched = 0;
        loop {
            let (state, deferred) = self.parts();
            while deferred.has_room() {
                let next = if state.waiters.is_empty() { None } else { state.take_next() };
                let Some((item, priority)) = next else {
                    state.is_releasing = false;
                    return matched;
                };
                let waiter = state.waiters.pop_front().expect("waiters emptied under lock (internal bug)");
                state.release_activity(1, deferred);
                state.dispatch(waiter, item, priority, deferred);
                matched += 1;
            }
            state.is_releasing = true;
            self.flush();
        }
    }

    // unlink up to `limit` queued items one at a time, in priority-then-FIFO order, and pass each
    // to `dropped` with the lock released. each item's count is released once its call returns.
    fn drop_items(&mut self, limit: usize, dropped: &mut dyn FnMut(T)) -> usize {
        let mut count = 0;
        while count < limit {
            let Some((item, _)) = self.state().lists.pop_first() else { break };
            drop(self.guard.take());
            self.run_deferred();
            dropped(item);
            self.guard = Some(self.queue.0.lockable.lock().unwrap());
            let (state, deferred) = self.parts();
            state.release_activity(1, deferred);
            count += 1;
        }
        count
    }

    // give back an item that was delivered to a dequeue operation nobody is left to take it from.
    // returns the item if its activation has already ended.
    pub(crate) fn restore(&mut self, version: u64, item: T, priority: usize) -> Option<T> {
        let (state, deferred) = self.parts();
        state.restore(version, item, priority, deferred)
    }
}

impl<'a, T, D> Drop for Lock<'a, T, D> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.run_deferred();
    }
}

impl<T, D> Lockable<T, D> {
    fn cancel_posted_wait(&mut self, op: &Arc<OpShared<T, D>>, deferred: &mut Deferred<T, D>) {
        // a stale link (the waiter was already matched or resolved) removes nothing
        if let Some(link) = op.request_cancel() {
            if let Some(waiter) = self.waiters.remove(link) {
                deferred.complete(waiter, Err(CancelledError.into()));
            }
        }
    }
}

impl<T, D> Deferred<T, D> {
    // complete a dequeue operation once the lock is released.
    pub(crate) fn complete(&mut self, op: Arc<OpShared<T, D>>, outcome: Result<(T, usize), DequeueError>) {
        self.0.push(Action::Complete(op, outcome));
    }

    // whether another match (a completion, and possibly the activation's end) fits inline.
    fn has_room(&self) -> bool {
        self.0.len() + 2 <= self.0.inline_size()
    }
}

impl<T, D: Discipline<T>> Lockable<T, D> {
    fn activate(&mut self, on_complete: OnComplete) -> Result<u64, ActivateError> {
        if self.is_active {
            return Err(ActivateError::AlreadyActive);
        }
        if self.activity != 0 {
            return Err(ActivateError::Draining);
        }
        assert!(self.lists.is_empty(), "items queued in an inactive queue (internal bug)");
        assert!(self.waiters.is_empty(), "waiters posted in an inactive queue (internal bug)");
        self.is_active = true;
        self.activity = 1;
        self.on_complete = Some(on_complete);
        trace!(queue = self.name, version = self.version, "activated");
        Ok(self.version)
    }

    fn enqueue(
        &mut self,
        item: T,
        priority: usize,
        deferred: &mut Deferred<T, D>,
    ) -> Result<Option<ItemKey>, EnqueueError<T>> {
        assert!(
            priority < self.lists.priorities(),
            "priority {} out of range for queue with {} priorities",
            priority,
            self.lists.priorities(),
        );
        if !self.is_active {
            return Err(EnqueueError { item, cause: ShutdownPendingError });
        }
        if let Some(waiter) = self.pop_waiter() {
            self.dispatch(waiter, item, priority, deferred);
            return Ok(None);
        }
        let node = self.insert_item_with(priority, item, NodeQueue::push_back);
        Ok(Some(ItemKey { queue: self.id, priority, node, version: self.version }))
    }

    fn cancel_enqueue(&mut self, key: ItemKey, deferred: &mut Deferred<T, D>) -> Option<T> {
        if key.queue != self.id || !self.is_active || key.version != self.version {
            return None;
        }
        let item = self.lists.lists.get_mut(key.priority)?.remove(key.node)?;
        // reverse the item's count
        self.release_activity(1, deferred);
        Some(item)
    }

    fn post_wait(&mut self, op: Arc<OpShared<T, D>>, deferred: &mut Deferred<T, D>) {
        if op.version() != self.version {
            debug_assert!(op.version() < self.version);
            // operation belongs to an older activation
            deferred.complete(op, Err(ShutdownPendingError.into()));
            return;
        }
        if op.take_cancel_request() {
            deferred.complete(op, Err(CancelledError.into()));
            return;
        }
        // while a release is in progress, queue up behind older waiters
        let next = if self.is_releasing && self.is_active { None } else { self.take_next() };
        if let Some((item, priority)) = next {
            self.discipline.on_dequeued(&item, priority);
            // reverse the item's count
            self.release_activity(1, deferred);
            deferred.complete(op, Ok((item, priority)));
        } else if self.is_active {
            let link = self.waiters.push_back(Arc::clone(&op));
            op.set_link(link);
        } else {
            // drained and shutting down
            deferred.complete(op, Err(ShutdownPendingError.into()));
        }
    }

    fn pause_dequeue(&mut self) {
        if !self.is_dequeue_paused {
            self.is_dequeue_paused = true;
            trace!(queue = self.name, "dequeue paused");
            self.discipline.on_paused();
        }
    }

    fn restore(
        &mut self,
        version: u64,
        item: T,
        priority: usize,
        deferred: &mut Deferred<T, D>,
    ) -> Option<T> {
        if version != self.version || self.activity == 0 {
            warn!(queue = self.name, version, "item of abandoned dequeue outlived its activation");
            return Some(item);
        }
        trace!(queue = self.name, priority, "restoring item of abandoned dequeue");
        if let Some(waiter) = self.pop_waiter() {
            self.dispatch(waiter, item, priority, deferred);
        } else {
            self.discipline.on_restored(&item, priority);
            self.insert_item_with(priority, item, NodeQueue::push_front);
        }
        None
    }

    // take the next ready item from the discipline, unless paused.
    fn take_next(&mut self) -> Option<(T, usize)> {
        if self.is_dequeue_paused {
            return None;
        }
        self.discipline.take_next(&mut self.lists)
    }

    // take the oldest waiter, unless paused or a release is in progress.
    pub(crate) fn pop_waiter(&mut self) -> Option<Arc<OpShared<T, D>>> {
        if self.is_dequeue_paused || self.is_releasing {
            return None;
        }
        self.waiters.pop_front()
    }

    // deliver an item that never got queued (or was already released from its list) to a waiter.
    pub(crate) fn dispatch(
        &mut self,
        waiter: Arc<OpShared<T, D>>,
        item: T,
        priority: usize,
        deferred: &mut Deferred<T, D>,
    ) {
        self.discipline.on_dequeued(&item, priority);
        deferred.complete(waiter, Ok((item, priority)));
    }

    // link an item into the list of a priority, with `place` choosing the position, and take a
    // count for it.
    pub(crate) fn insert_item_with<F>(&mut self, priority: usize, item: T, place: F) -> NodeKey
    where
        F: FnOnce(&mut NodeQueue<T>, T) -> NodeKey,
    {
        debug_assert!(self.activity > 0, "item queued without activity (internal bug)");
        self.activity += 1;
        let list = &mut self.lists.lists[priority];
        let node = place(list, item);
        let item = list.get(node).expect("placed item is not linked (internal bug)");
        self.discipline.on_enqueued(item, priority);
        node
    }

    // release counts. reaching zero ends the activation.
    fn release_activity(&mut self, count: usize, deferred: &mut Deferred<T, D>) {
        assert!(self.activity >= count, "activity count underflow (internal bug)");
        self.activity -= count;
        if self.activity == 0 {
            debug_assert!(!self.is_active);
            debug!(queue = self.name, version = self.version, "queue fully deactivated");
            // invalidate operations created under this version
            self.version += 1;
            if let Some(on_complete) = self.on_complete.take() {
                deferred.0.push(Action::Finished(on_complete));
            }
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is_active(&self) -> bool {
        self.is_active
    }

    pub(crate) fn is_dequeue_paused(&self) -> bool {
        self.is_dequeue_paused
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn activity(&self) -> usize {
        self.activity
    }

    pub(crate) fn lists(&self) -> &ItemLists<T> {
        &self.lists
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn discipline(&self) -> &D {
        &self.discipline
    }

    pub(crate) fn discipline_mut(&mut self) -> &mut D {
        &mut self.discipline
    }
}
