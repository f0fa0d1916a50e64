// implementation of the queue.
//
// the basic architecture is as such:
//
// queue handles wrap around Arc<Mutex<shared state>>
//                                         |
//          /------------------------------/
//          v
//       shared state
//          |
//          |------ it contains one node_queue::NodeQueue<T> per priority, holding the queued
//          |       items. the discipline decides which of them is released next.
//          |
//          |------ it contains a "waiter node queue":
//          |
//          |       this is a linked queue of posted dequeue operations that found no ready item.
//          |       each operation remembers the key of its node so that it can unlink itself on
//          |       cancellation, although using that key is still guarded by the central mutex.
//          |       the fact that they form a queue structure is used to achieve fairness.
//          |
//          \------ it contains the activity count and version of the current activation.
//
// the activity count is held once by the activation itself and once by every item the queue
// owns. deactivation gives up the activation's count, so the activation completes when the last
// item is dequeued or dropped. completing bumps the version, which strands operations created
// before it.
//
// nothing that can run user code happens under the lock. completions of dequeue operations and
// of activations are collected while locked and run when the lock is released. bulk matching
// releases the lock between batches, so that the collection never outgrows its inline storage.
//
// blocking versions of operations are built as a layer on top of the futures, in the polling
// module.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      discipline<------------core: This is the matching engine. It presents an abstraction
//                   |         ^ ^   for queues which is safe, but panicky and inconvenient.
//      node_queue<--/         | |
//                             | operation: This holds dequeue operation state, and delivers
//                             | ^          their completions.
//                             | |
//      polling<---------------api: This is a wrapper around core that adapts it into an API that
//                             ^    is convenient and defensive. The crate re-exports this API
//                             |    publically.
//                             |
//                             gate: This narrows the API into a queue of strictly ordered items.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod discipline;
pub(crate) mod gate;
pub(crate) mod operation;

mod core;
mod node_queue;
mod polling;
