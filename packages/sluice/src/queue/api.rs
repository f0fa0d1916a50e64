// exposed API of queues

use self::future::*;
use super::{
    core,
    discipline::{Discipline, Fifo},
    error::*,
    operation::DequeueOperation,
};
use tokio::sync::oneshot;


/// Default label of a queue in tracing events
const DEFAULT_NAME: &str = "queue";


/// Builder for an [`AsyncQueue`]
///
/// ```
/// let queue: sluice::AsyncQueue<String> = sluice::Builder::new()
///     .priorities(3)
///     .capacity(64)
///     .name("requests")
///     .build()
///     .unwrap();
/// assert_eq!(queue.priorities(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Builder<D = Fifo> {
    priorities: usize,
    capacity: usize,
    name: &'static str,
    discipline: D,
}

impl Builder<Fifo> {
    /// Construct with a single priority, no reserved capacity, and the [`Fifo`] discipline
    pub fn new() -> Self {
        Builder {
            priorities: 1,
            capacity: 0,
            name: DEFAULT_NAME,
            discipline: Fifo,
        }
    }
}

impl Default for Builder<Fifo> {
    fn default() -> Self {
        Builder::new()
    }
}

impl<D> Builder<D> {
    /// Number of priority levels, at least 1
    ///
    /// Priority 0 is the highest, `priorities - 1` the lowest.
    pub fn priorities(mut self, priorities: usize) -> Self {
        assert!(priorities > 0, "queue must have at least one priority");
        self.priorities = priorities;
        self
    }

    /// Number of items per priority, and of waiting dequeue operations, to reserve memory for
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Label attached to the queue's tracing events
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Use a custom [`Discipline`] to decide which queued item is released next
    pub fn discipline<D2>(self, discipline: D2) -> Builder<D2> {
        Builder {
            priorities: self.priorities,
            capacity: self.capacity,
            name: self.name,
            discipline,
        }
    }

    /// Build the queue, in its inactive state
    ///
    /// Errors if the requested capacity could not be reserved.
    pub fn build<T>(self) -> Result<AsyncQueue<T, D>, InsufficientResourcesError>
    where
        D: Discipline<T>,
    {
        core::Queue::new(self.name, self.priorities, self.capacity, self.discipline)
            .map(|queue| AsyncQueue { queue })
    }
}


/// Identity of an item queued by [`AsyncQueue::enqueue`], for use with
/// [`cancel_enqueue`](AsyncQueue::cancel_enqueue)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ItemKey(core::ItemKey);

impl ItemKey {
    /// Priority the item was queued at
    pub fn priority(&self) -> usize {
        self.0.priority
    }

    /// Version of the queue activation the item was queued in
    pub fn version(&self) -> u64 {
        self.0.version
    }
}

/// Successful outcome of [`AsyncQueue::enqueue`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Enqueued {
    /// The item was queued, and can be cancelled with this key until dequeued
    Queued(ItemKey),
    /// The item was handed directly to a waiting dequeue operation
    Dispatched,
}


/// Asynchronous multi-priority queue
///
/// Producers [`enqueue`](Self::enqueue) items synchronously, and consumers receive them through
/// [`DequeueOperation`]s, which complete through a callback, a future, or by blocking. Items are
/// released lowest priority number first, and first-in first-out within a priority, unless a
/// custom [`Discipline`] says otherwise. Waiting operations are served first-come first-served.
///
/// A queue goes through activation cycles. [`activate`](Self::activate) opens it, and
/// [`deactivate`](Self::deactivate) begins shutdown: waiting operations resolve with
/// [`DequeueError::ShutdownPending`], and items still queued are either drained by later
/// dequeues or handed to a drop callback. Once the queue holds nothing, the activation completes
/// and the queue's version advances, after which it may be activated again.
///
/// This is a cheaply cloneable handle, and all clones refer to the same queue.
pub struct AsyncQueue<T, D = Fifo> {
    pub(crate) queue: core::Queue<T, D>,
}

impl<T> AsyncQueue<T> {
    /// Construct an inactive queue with a single priority
    pub fn new() -> Self {
        Self::with_priorities(1)
    }

    /// Construct an inactive queue with the given number of priorities
    ///
    /// Panics if `priorities` is 0.
    pub fn with_priorities(priorities: usize) -> Self {
        Builder::new()
            .priorities(priorities)
            .build()
            .expect("no capacity to reserve")
    }

    /// Configure a queue with a [`Builder`]
    pub fn builder() -> Builder<Fifo> {
        Builder::new()
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, D: Discipline<T>> AsyncQueue<T, D> {
    /// Activate the queue, returning a future that resolves once this activation has fully
    /// deactivated
    ///
    /// Errors if the queue is already active, or is still draining a previous activation.
    pub fn activate(&self) -> Result<Deactivated, ActivateError> {
        let (send, recv) = oneshot::channel();
        self.activate_with(move || {
            let _ = send.send(());
        })?;
        Ok(Deactivated::new(recv))
    }

    /// Activate the queue, calling `on_complete` once this activation has fully deactivated
    ///
    /// `on_complete` runs on whichever thread released the queue's last item or activation, with
    /// no queue lock held.
    pub fn activate_with<F>(&self, on_complete: F) -> Result<(), ActivateError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.lock().activate(Box::new(on_complete)).map(drop)
    }

    /// Begin shutdown, leaving queued items to be drained by dequeue operations
    ///
    /// Before this returns, every waiting dequeue operation has completed with
    /// [`DequeueError::ShutdownPending`]. Errors if the queue is not active.
    pub fn deactivate(&self) -> Result<(), ShutdownPendingError> {
        self.queue.deactivate(None)
    }

    /// Begin shutdown, handing every queued item to `dropped`
    ///
    /// Before this returns, every waiting dequeue operation has completed with
    /// [`DequeueError::ShutdownPending`], and `dropped` has been called once per queued item, in
    /// priority order. The activation completes only after the last call to `dropped` returns.
    /// Errors if the queue is not active, in which case `dropped` is never called.
    pub fn deactivate_dropping<F>(&self, mut dropped: F) -> Result<(), ShutdownPendingError>
    where
        F: FnMut(&Self, T),
    {
        let mut dropped = |item| dropped(self, item);
        self.queue.deactivate(Some(&mut dropped))
    }

    /// Enqueue an item at a priority, or hand it directly to a waiting dequeue operation
    ///
    /// Errors, giving back the item, if the queue is not active. Panics if `priority` is out of
    /// range.
    pub fn enqueue(&self, item: T, priority: usize) -> Result<Enqueued, EnqueueError<T>> {
        self.queue.lock()
            .enqueue(item, priority)
            .map(|key| key.map(ItemKey).map_or(Enqueued::Dispatched, Enqueued::Queued))
    }

    /// Enqueue an item at the lowest priority
    pub fn push(&self, item: T) -> Result<Enqueued, EnqueueError<T>> {
        self.enqueue(item, self.priorities() - 1)
    }

    /// Remove a queued item before it is dequeued
    ///
    /// Returns `None` if the item has already been dequeued, cancelled, or dropped, if the queue
    /// is not active, or if the key was issued by another queue.
    pub fn cancel_enqueue(&self, key: ItemKey) -> Option<T> {
        self.queue.lock().cancel_enqueue(key.0)
    }

    /// Remove every queued item, handing each to `dropped`
    ///
    /// Works while active and while draining. Returns the number of items dropped. Errors if the
    /// queue was never activated or has fully deactivated.
    pub fn cancel_all_enqueued<F>(&self, mut dropped: F) -> Result<usize, NotStartedError>
    where
        F: FnMut(&Self, T),
    {
        let mut dropped = |item| dropped(self, item);
        self.queue.cancel_all_enqueued(&mut dropped)
    }

    /// Stop matching items with dequeue operations until [`resume_dequeue`](Self::resume_dequeue)
    pub fn pause_dequeue(&self) {
        self.queue.lock().pause_dequeue();
    }

    /// Resume matching, completing waiting dequeue operations with queued items
    pub fn resume_dequeue(&self) {
        self.queue.lock().resume_dequeue();
    }

    /// Create a dequeue operation bound to the current activation
    pub fn create_dequeue_operation(&self) -> DequeueOperation<T, D> {
        let version = self.queue.lock().state().version();
        DequeueOperation::new(self.queue.clone(), version)
    }

    /// Create a future to dequeue an item
    ///
    /// Shorthand for creating a dequeue operation and [waiting](DequeueOperation::wait) on it.
    pub fn dequeue(&self) -> DequeueFut<T, D> {
        self.create_dequeue_operation().wait()
    }

    /// Number of items currently queued, across priorities
    pub fn queued_len(&self) -> usize {
        self.queue.lock().state().lists().total_len()
    }

    /// Number of items currently queued at a priority
    pub fn queued_len_at(&self, priority: usize) -> usize {
        self.queue.lock().state().lists().len(priority)
    }

    /// Number of dequeue operations waiting for an item
    pub fn waiter_count(&self) -> usize {
        self.queue.lock().state().waiter_count()
    }

    /// Version of the current or next activation
    ///
    /// Starts at 1 and advances each time an activation completes.
    pub fn version(&self) -> u64 {
        self.queue.lock().state().version()
    }

    /// Whether the queue is active, as opposed to never activated, draining, or deactivated
    pub fn is_active(&self) -> bool {
        self.queue.lock().state().is_active()
    }

    /// Whether the current activation has completed, or there was none
    pub fn is_deactivated(&self) -> bool {
        self.queue.lock().state().activity() == 0
    }

    /// Whether dequeueing is paused
    pub fn is_dequeue_paused(&self) -> bool {
        self.queue.lock().state().is_dequeue_paused()
    }

    /// Number of priority levels
    pub fn priorities(&self) -> usize {
        self.queue.lock().state().lists().priorities()
    }

    /// Label of the queue in tracing events
    pub fn name(&self) -> &'static str {
        self.queue.lock().state().name()
    }

    /// Whether two handles refer to the same queue
    pub fn same_queue(&self, other: &Self) -> bool {
        self.queue.ptr_eq(&other.queue)
    }
}

impl<T, D> Clone for AsyncQueue<T, D> {
    fn clone(&self) -> Self {
        AsyncQueue { queue: self.queue.clone() }
    }
}

impl<T, D: Discipline<T>> std::fmt::Debug for AsyncQueue<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut lock = self.queue.lock();
        let state = lock.state();
        f.debug_struct("AsyncQueue")
            .field("name", &state.name())
            .field("version", &state.version())
            .field("is_active", &state.is_active())
            .field("queued", &state.lists().total_len())
            .field("waiters", &state.waiter_count())
            .finish()
    }
}


// ==== futures ====


pub(crate) mod future {
    use super::*;
    use crate::queue::polling::{Abort, Timeout, poll};
    use std::{
        task::{Poll, Context},
        future::Future,
        pin::Pin,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    /// Future for dequeueing an item through a [`DequeueOperation`]
    ///
    /// The operation is started when this future is first polled. If this future is dropped
    /// before resolving, the operation is cancelled. If the operation had already been matched
    /// with an item by then, the item goes back to the front of its priority list, or straight
    /// to the oldest waiting operation, so that dropping this future never loses an item. This
    /// makes it safe to race against a timeout or in `select!`.
    pub struct DequeueFut<T, D = Fifo> {
        op: DequeueOperation<T, D>,
        terminated: bool,
        // gives back an item matched after this future was dropped.
        restore: fn(&DequeueOperation<T, D>),
    }

    fn map_try_dequeue_result<T>(
        result: Result<Result<T, DequeueError>, Result<T, DequeueError>>,
    ) -> Result<T, TryDequeueError> {
        match result {
            Ok(result) => result.map_err(TryDequeueError::from),
            // timed out, and our own cancellation won the race
            Err(Err(DequeueError::Cancelled(_))) => Err(WouldBlockError.into()),
            // timed out, but the operation resolved before it could be cancelled
            Err(result) => result.map_err(TryDequeueError::from),
        }
    }

    impl<T, D: Discipline<T>> DequeueFut<T, D> {
        pub(crate) fn new(op: DequeueOperation<T, D>) -> Self {
            DequeueFut {
                op,
                terminated: false,
                restore: DequeueOperation::restore_item,
            }
        }

        /// The operation this future drives
        pub fn operation(&self) -> &DequeueOperation<T, D> {
            &self.op
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving, with [`WouldBlockError`] if no item was available.
        /// This method will panic if this future has already resolved.
        pub fn try_now(&mut self) -> Result<T, TryDequeueError> {
            assert!(!self.is_terminated(), "DequeueFut.try_now called after terminated");
            map_try_dequeue_result(poll(self, Timeout::NonBlocking))
        }

        /// Block until this future resolves
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving. This method will panic if this future has already
        /// resolved.
        pub fn block(&mut self) -> Result<T, DequeueError> {
            assert!(!self.is_terminated(), "DequeueFut.block called after terminated");
            poll(self, Timeout::Never).ok().expect("poll timed out with Timeout::Never")
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving, with [`WouldBlockError`] if the timeout elapsed
        /// first. This method will panic if this future has already resolved.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<T, TryDequeueError> {
            assert!(!self.is_terminated(), "DequeueFut.block_timeout called after terminated");
            self.block_deadline(Instant::now() + timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving, with [`WouldBlockError`] if the deadline was reached
        /// first. This method will panic if this future has already resolved.
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<T, TryDequeueError> {
            assert!(!self.is_terminated(), "DequeueFut.block_deadline called after terminated");
            map_try_dequeue_result(poll(self, Timeout::At(deadline)))
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.terminated
        }
    }

    impl<T, D: Discipline<T>> Future for DequeueFut<T, D> {
        type Output = Result<T, DequeueError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.terminated {
                return Poll::Pending;
            }
            if this.op.op.register_waker(cx.waker()) {
                this.op.queue.lock().post_wait(Arc::clone(&this.op.op));
            }
            match this.op.op.take_outcome() {
                Some(outcome) => {
                    this.terminated = true;
                    Poll::Ready(outcome)
                }
                None => Poll::Pending,
            }
        }
    }

    impl<T, D: Discipline<T>> Abort for DequeueFut<T, D> {
        fn abort(&mut self) {
            self.op.cancel();
        }
    }

    #[cfg(feature = "futures")]
    impl<T, D: Discipline<T>> futures::future::FusedFuture for DequeueFut<T, D> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T, D> Drop for DequeueFut<T, D> {
        fn drop(&mut self) {
            // a panic under the queue's lock poisons it
            if self.terminated || thread::panicking() {
                return;
            }
            self.op.cancel();
            if self.op.op.abandon(self.restore) {
                (self.restore)(&self.op);
            }
        }
    }


    /// Future which resolves once an activation of an [`AsyncQueue`] has fully deactivated
    ///
    /// That is, once the queue was deactivated, every queued item was dequeued or dropped, and
    /// every drop callback returned. Also resolves if the queue is dropped while active, as its
    /// activation can then never complete.
    pub struct Deactivated {
        recv: oneshot::Receiver<()>,
        terminated: bool,
    }

    impl Deactivated {
        pub(crate) fn new(recv: oneshot::Receiver<()>) -> Self {
            Deactivated { recv, terminated: false }
        }

        /// Whether the activation has fully deactivated, without blocking
        pub fn try_now(&mut self) -> bool {
            if !self.terminated {
                self.terminated = !matches!(
                    self.recv.try_recv(),
                    Err(oneshot::error::TryRecvError::Empty),
                );
            }
            self.terminated
        }

        /// Block until the activation has fully deactivated
        ///
        /// Must not be called from within an asynchronous execution context.
        pub fn block(self) {
            if !self.terminated {
                let _ = self.recv.blocking_recv();
            }
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.terminated
        }
    }

    impl Future for Deactivated {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.terminated {
                return Poll::Pending;
            }
            match Pin::new(&mut this.recv).poll(cx) {
                Poll::Ready(_) => {
                    this.terminated = true;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            }
        }
    }

    #[cfg(feature = "futures")]
    impl futures::future::FusedFuture for Deactivated {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }
}


// ==== tests ====
