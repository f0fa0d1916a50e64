// dequeue discipline: the strategy a queue consults, under its lock, about which queued item is
// released next, plus notification hooks around enqueue, dequeue, pause, and resume.

use super::node_queue::NodeQueue;


/// Strategy deciding which queued item a queue releases next
///
/// Every method is called while the queue's lock is held, so implementations must be quick and
/// must not block or call back into the queue. State kept in the discipline is protected by the
/// same lock as the queue's item lists.
pub trait Discipline<T>: Send + 'static {
    /// Called just after `item` was appended to the list of `priority`
    fn on_enqueued(&mut self, item: &T, priority: usize) {
        let _ = (item, priority);
    }

    /// Called just before `item`, taken from the list of `priority` or handed directly from a
    /// producer, is delivered to a dequeue operation
    fn on_dequeued(&mut self, item: &T, priority: usize) {
        let _ = (item, priority);
    }

    /// Called just before `item`, which was delivered to a dequeue operation that got abandoned
    /// before anyone took it, goes back to the front of the list of `priority`
    ///
    /// [`on_enqueued`](Self::on_enqueued) follows once it is linked.
    fn on_restored(&mut self, item: &T, priority: usize) {
        let _ = (item, priority);
    }

    /// Called when dequeueing becomes paused
    fn on_paused(&mut self) {}

    /// Called when dequeueing resumes, after waiting operations were matched with items
    ///
    /// Skipped if dequeueing was paused again before matching finished.
    fn on_resumed(&mut self) {}

    /// Remove and return the next item ready for release, with its priority
    ///
    /// Returning `None` while items are queued keeps them queued until a later attempt.
    fn take_next(&mut self, lists: &mut ItemLists<T>) -> Option<(T, usize)> {
        lists.pop_first()
    }
}

/// The default discipline: lowest priority number first, first-in first-out within a priority
#[derive(Debug, Default, Copy, Clone)]
pub struct Fifo;

impl<T> Discipline<T> for Fifo {}


/// The per-priority item lists of a queue, as seen by its [`Discipline`]
pub struct ItemLists<T> {
    pub(crate) lists: Box<[NodeQueue<T>]>,
}

impl<T> ItemLists<T> {
    pub(crate) fn new(priorities: usize) -> Self {
        ItemLists {
            lists: (0..priorities).map(|_| NodeQueue::new()).collect(),
        }
    }

    /// Number of priority levels
    pub fn priorities(&self) -> usize {
        self.lists.len()
    }

    /// Number of items queued at `priority`
    pub fn len(&self, priority: usize) -> usize {
        self.lists[priority].len()
    }

    /// Number of items queued across all priorities
    pub fn total_len(&self) -> usize {
        self.lists.iter().map(NodeQueue::len).sum()
    }

    /// Whether no items are queued at any priority
    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(NodeQueue::is_empty)
    }

    /// Borrow the oldest item queued at `priority`
    pub fn front(&self, priority: usize) -> Option<&T> {
        self.lists[priority].front()
    }

    /// Remove the oldest item queued at `priority`
    pub fn pop_front(&mut self, priority: usize) -> Option<T> {
        self.lists[priority].pop_front()
    }

    /// Iterate over the items queued at `priority`, oldest first
    pub fn iter(&self, priority: usize) -> impl Iterator<Item = &T> + '_ {
        self.lists[priority].iter()
    }

    /// Remove the oldest item of the highest non-empty priority
    pub fn pop_first(&mut self) -> Option<(T, usize)> {
        self.lists.iter_mut()
            .enumerate()
            .find_map(|(priority, list)| list.pop_front().map(|item| (item, priority)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_takes_highest_priority_first() {
        let mut lists = ItemLists::new(3);
        lists.lists[2].push_back('a');
        lists.lists[1].push_back('b');
        lists.lists[1].push_back('c');
        assert_eq!(lists.total_len(), 3);
        assert_eq!(lists.iter(1).collect::<String>(), "bc");

        let mut fifo = Fifo;
        assert_eq!(Discipline::take_next(&mut fifo, &mut lists), Some(('b', 1)));
        assert_eq!(Discipline::take_next(&mut fifo, &mut lists), Some(('c', 1)));
        assert_eq!(Discipline::take_next(&mut fifo, &mut lists), Some(('a', 2)));
        assert_eq!(Discipline::take_next(&mut fifo, &mut lists), None);
        assert!(lists.is_empty());
    }
}
