// queue error types.

use thiserror::Error;


// ==== base error types ====


/// Error for trying to use a queue that is not active, or is deactivating
///
/// Producers see this when enqueueing into such a queue, and consumers see the same lifecycle
/// event as [`DequeueError::ShutdownPending`].
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("queue is shutting down or not active")]
pub struct ShutdownPendingError;

/// Error for trying to drop the enqueued items of a queue which has no activity, because it was
/// never activated or has fully deactivated
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("queue has not been started")]
pub struct NotStartedError;

/// Error for a dequeue operation which was cancelled before it was matched with an item
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("dequeue operation was cancelled")]
pub struct CancelledError;

/// Error for failing to reserve memory while building a queue
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("insufficient resources to build queue")]
pub struct InsufficientResourcesError;

/// Error for trying to enqueue an item into an ordered gate with an order key lower than the
/// gate's next expected key
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("order key precedes the next expected key")]
pub struct KeyTooLowError;

/// Error for trying to enqueue an item into an ordered gate while an item with the same order key
/// is already queued
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("an item with the same order key is already queued")]
pub struct DuplicateKeyError;

/// Error for a non-blocking or deadline-limited dequeue which did not resolve in time
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Error for trying to activate a queue
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ActivateError {
    /// The queue is already active
    #[error("queue is already active")]
    AlreadyActive,
    /// The queue was deactivated but still holds items or an undelivered drop
    #[error("queue is still draining its previous activation")]
    Draining,
}

/// Error for trying to enqueue an item
///
/// Gives the item back to the caller.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("{cause}")]
pub struct EnqueueError<T> {
    /// The item that could not be enqueued
    pub item: T,
    /// The reason the item could not be enqueued
    pub cause: ShutdownPendingError,
}

/// Reason an item could not be enqueued into an ordered gate
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EnqueueOrderedCause {
    /// The gate is not active, or is deactivating
    #[error(transparent)]
    ShutdownPending(ShutdownPendingError),
    /// The item's order key is lower than the gate's next expected key
    #[error(transparent)]
    KeyTooLow(KeyTooLowError),
    /// An item with the same order key is already queued
    #[error(transparent)]
    DuplicateKey(DuplicateKeyError),
}

compound_from!(EnqueueOrderedCause {
    ShutdownPending(ShutdownPendingError),
    KeyTooLow(KeyTooLowError),
    DuplicateKey(DuplicateKeyError),
});

/// Error for trying to enqueue an item into an ordered gate
///
/// Gives the item back to the caller.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("{cause}")]
pub struct EnqueueOrderedError<T> {
    /// The item that could not be enqueued
    pub item: T,
    /// The reason the item could not be enqueued
    pub cause: EnqueueOrderedCause,
}

/// Terminal error state of a dequeue operation
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DequeueError {
    /// The queue is deactivating and has no items left for this operation, or the operation
    /// belongs to an older activation of the queue
    #[error(transparent)]
    ShutdownPending(ShutdownPendingError),
    /// The operation was cancelled before being matched with an item
    #[error(transparent)]
    Cancelled(CancelledError),
}

compound_from!(DequeueError {
    ShutdownPending(ShutdownPendingError),
    Cancelled(CancelledError),
});

/// Error for trying to dequeue with no or limited blocking
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TryDequeueError {
    /// The operation reached a terminal error state
    #[error(transparent)]
    Terminal(DequeueError),
    /// The operation could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TryDequeueError {
    Terminal(DequeueError),
    WouldBlock(WouldBlockError),
});
