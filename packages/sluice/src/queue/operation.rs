// dequeue operations: single-shot, reusable requests for one item from a queue.

use super::{
    core::Queue,
    discipline::{Discipline, Fifo},
    error::*,
    node_queue::NodeKey,
};
use std::{
    mem::replace,
    sync::{Arc, Mutex},
    task::Waker,
};


// completion callback of an operation started with DequeueOperation::start.
type Callback<T, D> = Box<dyn FnOnce(&DequeueOperation<T, D>) + Send>;

// operation shared state.
//
// lock order is queue, then operation. the operation lock is never held while calling user code.
pub(crate) struct OpShared<T, D> {
    // version of the queue this operation was created under.
    version: u64,
    state: Mutex<OpState<T, D>>,
}

enum OpState<T, D> {
    // not started, or reused.
    Idle,
    // started and not yet completed.
    Pending {
        notify: Notify<T, D>,
        // position in the queue's waiter list, once posted. may be stale after the queue removed
        // it, which the generational node key tolerates.
        link: Option<NodeKey>,
        // cancel was requested before the operation was posted.
        cancel_requested: bool,
    },
    // completed. the item, with the priority it was dequeued from, is present until taken.
    Complete {
        result: Result<(), DequeueError>,
        item: Option<(T, usize)>,
    },
}

// how to notify of completion.
pub(crate) enum Notify<T, D> {
    Callback(Callback<T, D>),
    Waker(Option<Waker>),
    // nobody is left to take the outcome.
    Restore(fn(&DequeueOperation<T, D>)),
}

/// Status of a [`DequeueOperation`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OperationStatus {
    /// Not started, or reused since its last completion
    Idle,
    /// Started and waiting for an item
    Pending,
    /// Completed with an item
    Succeeded,
    /// Completed by cancellation, without an item
    Cancelled,
    /// Completed without an item because the queue was shutting down, or the operation belongs to
    /// an older activation of the queue
    ShutdownPending,
}

/// Request for a single item from an [`AsyncQueue`](crate::AsyncQueue)
///
/// An operation is bound to the activation of the queue it was created in. Starting it against a
/// later activation completes it immediately with [`DequeueError::ShutdownPending`].
///
/// An operation completes exactly once per start, either with an item, as cancelled, or as
/// shutdown pending. It may be [reused](Self::reuse) after completing. This is a cheaply cloneable
/// handle, and all clones refer to the same operation.
pub struct DequeueOperation<T, D = Fifo> {
    pub(crate) op: Arc<OpShared<T, D>>,
    pub(crate) queue: Queue<T, D>,
}

impl<T, D: Discipline<T>> DequeueOperation<T, D> {
    pub(crate) fn new(queue: Queue<T, D>, version: u64) -> Self {
        DequeueOperation {
            op: Arc::new(OpShared {
                version,
                state: Mutex::new(OpState::Idle),
            }),
            queue,
        }
    }

    /// Start the operation, calling `on_complete` once it completes
    ///
    /// If an item is available, the operation completes (and `on_complete` is called) before this
    /// returns. Otherwise the operation waits in FIFO order with other waiting operations.
    /// `on_complete` runs on whichever thread completes the operation, with no queue lock held,
    /// and may call back into the queue.
    ///
    /// Panics if the operation is not idle.
    pub fn start<F>(&self, on_complete: F)
    where
        F: FnOnce(&DequeueOperation<T, D>) + Send + 'static,
    {
        assert!(
            self.op.begin(Notify::Callback(Box::new(on_complete))),
            "DequeueOperation started while not idle",
        );
        self.queue.lock().post_wait(Arc::clone(&self.op));
    }

    /// Create a future which starts the operation and resolves to its outcome
    ///
    /// See [`DequeueFut`](crate::future::DequeueFut).
    pub fn wait(&self) -> crate::future::DequeueFut<T, D> {
        crate::future::DequeueFut::new(self.clone())
    }

    /// Take the dequeued item out of a succeeded operation
    ///
    /// Returns `None` if the operation has not succeeded or the item was already taken.
    pub fn take_item(&self) -> Option<T> {
        match &mut *self.op.state.lock().unwrap() {
            OpState::Complete { item, .. } => item.take().map(|(item, _)| item),
            _ => None,
        }
    }

    /// Outcome of the operation, if it has completed
    pub fn result(&self) -> Option<Result<(), DequeueError>> {
        match &*self.op.state.lock().unwrap() {
            &OpState::Complete { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Current status of the operation
    pub fn status(&self) -> OperationStatus {
        match &*self.op.state.lock().unwrap() {
            OpState::Idle => OperationStatus::Idle,
            OpState::Pending { .. } => OperationStatus::Pending,
            OpState::Complete { result: Ok(()), .. } => OperationStatus::Succeeded,
            OpState::Complete { result: Err(DequeueError::Cancelled(_)), .. } =>
                OperationStatus::Cancelled,
            OpState::Complete { result: Err(DequeueError::ShutdownPending(_)), .. } =>
                OperationStatus::ShutdownPending,
        }
    }

    /// Return a completed operation to idle so it may be started again
    ///
    /// An item not yet taken is dropped. The operation stays bound to the activation it was
    /// created in. Does nothing if the operation is already idle.
    ///
    /// Panics if the operation is pending.
    pub fn reuse(&self) {
        let prev = {
            let mut state = self.op.state.lock().unwrap();
            assert!(
                !matches!(*state, OpState::Pending { .. }),
                "DequeueOperation reused while pending",
            );
            replace(&mut *state, OpState::Idle)
        };
        // any untaken item drops here, outside the lock
        drop(prev);
    }

    /// Version of the queue activation this operation is bound to
    pub fn version(&self) -> u64 {
        self.op.version
    }

    // return the item of a succeeded operation to the front of its list, or to a waiter.
    pub(crate) fn restore_item(&self) {
        let taken = match &mut *self.op.state.lock().unwrap() {
            OpState::Complete { item, .. } => item.take(),
            _ => None,
        };
        if let Some((item, priority)) = taken {
            let outlived = self.queue.lock().restore(self.op.version, item, priority);
            // dropped with the lock released
            drop(outlived);
        }
    }
}

impl<T, D> DequeueOperation<T, D> {
    /// Cancel the operation if it is still waiting for an item
    ///
    /// If the operation is waiting, it completes as cancelled before this returns. If it has
    /// already been matched with an item, or has completed, this does nothing. If it has not been
    /// started, this does nothing either. An operation that is being started concurrently still
    /// observes the cancellation.
    pub fn cancel(&self) {
        self.queue.lock().cancel_posted_wait(&self.op);
    }
}

impl<T, D> Clone for DequeueOperation<T, D> {
    fn clone(&self) -> Self {
        DequeueOperation {
            op: Arc::clone(&self.op),
            queue: self.queue.clone(),
        }
    }
}

impl<T, D> std::fmt::Debug for DequeueOperation<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DequeueOperation")
            .field("version", &self.op.version)
            .finish_non_exhaustive()
    }
}

impl<T, D> OpShared<T, D> {
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    // transition idle to pending. returns false if not idle.
    pub(crate) fn begin(&self, notify: Notify<T, D>) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, OpState::Idle) {
            return false;
        }
        *state = OpState::Pending { notify, link: None, cancel_requested: false };
        true
    }

    // store the position in the waiter list. called with the queue lock held.
    pub(crate) fn set_link(&self, key: NodeKey) {
        if let OpState::Pending { link, .. } = &mut *self.state.lock().unwrap() {
            *link = Some(key);
        }
    }

    // consume a cancel request made before posting. called with the queue lock held.
    pub(crate) fn take_cancel_request(&self) -> bool {
        match &mut *self.state.lock().unwrap() {
            OpState::Pending { cancel_requested, .. } => replace(cancel_requested, false),
            _ => false,
        }
    }

    // request cancellation, returning the waiter link if the operation was posted. if it is
    // pending but not yet posted, the request is remembered for when it is. called with the queue
    // lock held.
    pub(crate) fn request_cancel(&self) -> Option<NodeKey> {
        match &mut *self.state.lock().unwrap() {
            OpState::Pending { link: Some(link), .. } => Some(*link),
            OpState::Pending { link: None, cancel_requested, .. } => {
                *cancel_requested = true;
                None
            }
            _ => None,
        }
    }

    // register a waker to notify on completion. returns whether the operation was just started
    // by this call, in which case the caller must post it.
    //
    // panics if the operation was started with a callback.
    pub(crate) fn register_waker(&self, waker: &Waker) -> bool {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, OpState::Idle) {
            *state = OpState::Pending {
                notify: Notify::Waker(Some(waker.clone())),
                link: None,
                cancel_requested: false,
            };
            return true;
        }
        match &mut *state {
            OpState::Pending { notify: Notify::Waker(slot), .. } => {
                if !slot.as_ref().is_some_and(|w| w.will_wake(waker)) {
                    *slot = Some(waker.clone());
                }
            }
            OpState::Pending { notify: Notify::Callback(_), .. } =>
                panic!("awaited a DequeueOperation that was started with a callback"),
            _ => (),
        }
        false
    }

    // arrange for a matched item to be restored once nobody is left to take it. returns true if
    // the operation already succeeded, in which case the caller must restore it. otherwise, if the
    // operation is still pending, its completion will call `restore` instead of notifying.
    pub(crate) fn abandon(&self, restore: fn(&DequeueOperation<T, D>)) -> bool {
        match &mut *self.state.lock().unwrap() {
            OpState::Pending { notify, .. } => {
                *notify = Notify::Restore(restore);
                false
            }
            OpState::Complete { result: Ok(()), item } => item.is_some(),
            _ => false,
        }
    }

    // take the outcome of a completed operation, including its item.
    pub(crate) fn take_outcome(&self) -> Option<Result<T, DequeueError>> {
        match &mut *self.state.lock().unwrap() {
            OpState::Complete { result: Ok(()), item } =>
                Some(Ok(item.take().expect("dequeued item was already taken").0)),
            OpState::Complete { result: Err(e), .. } => Some(Err(*e)),
            _ => None,
        }
    }
}

// complete an operation and notify it. called with the queue lock released.
//
// panics if the operation is not pending, as each start completes exactly once.
pub(crate) fn complete<T, D>(
    queue: &Queue<T, D>,
    op: Arc<OpShared<T, D>>,
    outcome: Result<(T, usize), DequeueError>,
) {
    let completed = match outcome {
        Ok(item) => OpState::Complete { result: Ok(()), item: Some(item) },
        Err(e) => OpState::Complete { result: Err(e), item: None },
    };
    let notify = {
        let mut state = op.state.lock().unwrap();
        match replace(&mut *state, completed) {
            OpState::Pending { notify, .. } => notify,
            _ => panic!("dequeue operation completed while not pending (internal bug)"),
        }
    };
    match notify {
        Notify::Callback(on_complete) => on_complete(&DequeueOperation {
            op,
            queue: queue.clone(),
        }),
        Notify::Restore(restore) => restore(&DequeueOperation {
            op,
            queue: queue.clone(),
        }),
        Notify::Waker(Some(waker)) => waker.wake(),
        Notify::Waker(None) => (),
    }
}


#[cfg(test)]
mod tests {
    use crate::{*, error::*};
    use std::sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc, Mutex,
    };

    #[test]
    fn callback_completes_synchronously_with_queued_item() {
        let queue = AsyncQueue::new();
        let _done = queue.activate().unwrap();
        queue.push(7).unwrap();

        let op = queue.create_dequeue_operation();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        op.start(move |op| {
            *seen2.lock().unwrap() = op.take_item();
        });
        assert_eq!(*seen.lock().unwrap(), Some(7));
        assert_eq!(op.status(), OperationStatus::Succeeded);
        assert_eq!(op.take_item(), None);
    }

    #[test]
    fn cancel_waiting_operation() {
        let queue = AsyncQueue::<u32>::new();
        let _done = queue.activate().unwrap();
        let op = queue.create_dequeue_operation();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        op.start(move |_| {
            fired2.fetch_add(1, SeqCst);
        });
        assert_eq!(op.status(), OperationStatus::Pending);
        assert_eq!(queue.waiter_count(), 1);

        op.cancel();
        assert_eq!(op.status(), OperationStatus::Cancelled);
        assert_eq!(op.result(), Some(Err(DequeueError::Cancelled(CancelledError))));
        assert_eq!(queue.waiter_count(), 0);

        // a second cancel, or an item arriving afterwards, never completes it again
        op.cancel();
        queue.push(1).unwrap();
        assert_eq!(fired.load(SeqCst), 1);
        assert_eq!(queue.queued_len(), 1);
    }

    #[test]
    fn reuse_within_version() {
        let queue = AsyncQueue::new();
        let _done = queue.activate().unwrap();
        let op = queue.create_dequeue_operation();
        for i in 0..3 {
            queue.push(i).unwrap();
            op.start(|_| ());
            assert_eq!(op.take_item(), Some(i));
            op.reuse();
            assert_eq!(op.status(), OperationStatus::Idle);
        }
    }

    #[test]
    #[should_panic]
    fn start_twice_panics() {
        let queue = AsyncQueue::<u32>::new();
        let _done = queue.activate().unwrap();
        let op = queue.create_dequeue_operation();
        op.start(|_| ());
        op.start(|_| ());
    }

    #[test]
    fn callback_may_reenter_queue() {
        let queue = AsyncQueue::new();
        let _done = queue.activate().unwrap();
        let op = queue.create_dequeue_operation();
        let queue2 = queue.clone();
        op.start(move |op| {
            let item = op.take_item().unwrap();
            queue2.push(item + 1).unwrap();
        });
        queue.push(1).unwrap();
        assert_eq!(queue.queued_len(), 1);
        assert_eq!(queue.dequeue().try_now(), Ok(2));
    }
}
