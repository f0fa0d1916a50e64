//! Asynchronous multi-priority queue with drainable shutdown, and an ordered gate built on it.
//!
//! Producers hand items to an [`AsyncQueue`] without blocking, and consumers take them through
//! [`DequeueOperation`]s, which can complete through a callback, be awaited, or be blocked on.
//! An [`OrderedGate`] releases items strictly in the order of a key they carry.
//!
//! ```
//! use sluice::AsyncQueue;
//!
//! let queue = AsyncQueue::with_priorities(2);
//! let deactivated = queue.activate().unwrap();
//! queue.enqueue("later", 1).unwrap();
//! queue.enqueue("sooner", 0).unwrap();
//! assert_eq!(queue.dequeue().block(), Ok("sooner"));
//! assert_eq!(queue.dequeue().block(), Ok("later"));
//! queue.deactivate().unwrap();
//! deactivated.block();
//! ```

#[macro_use]
extern crate tracing;

mod queue;

pub use crate::queue::{
    api::{AsyncQueue, Builder, Enqueued, ItemKey},
    discipline::{Discipline, Fifo, ItemLists},
    gate::{Ordered, OrderedDequeueFut, OrderedDequeueOperation, OrderedDiscipline, OrderedGate},
    operation::{DequeueOperation, OperationStatus},
};

/// Error types
pub mod error {
    pub use crate::queue::error::*;
}

/// Future types
pub mod future {
    pub use crate::queue::api::future::*;
}
