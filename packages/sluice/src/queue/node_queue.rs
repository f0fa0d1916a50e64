// linked node lists of the queue: one per priority for items, one for waiters.
//
// nodes are linked by slot index rather than by pointer. the slab of slots is owned by the
// list, and a node is addressed from outside by a NodeKey carrying its slot index and the slot's
// generation at insertion time. unlinking a node bumps its slot's generation, so a key kept
// around after its node left the list can never alias a newer node reusing the same slot.

use std::{
    collections::TryReserveError,
    iter,
    mem::replace,
};


// handle to a node linked into a NodeQueue.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct NodeKey {
    idx: u32,
    gen: u32,
}

// doubly linked list of nodes.
pub(crate) struct NodeQueue<T> {
    // slab of slots. occupied slots are the linked nodes.
    slots: Vec<Slot<T>>,
    // front and back of queue, unless queue is empty.
    front_back: Option<(u32, u32)>,
    // head of the chain of vacant slots.
    free: Option<u32>,
    // number of linked nodes.
    len: usize,
}

struct Slot<T> {
    // incremented every time the slot becomes vacant.
    gen: u32,
    entry: Entry<T>,
}

enum Entry<T> {
    Vacant {
        // next vacant slot in the free chain.
        next_free: Option<u32>,
    },
    Occupied(Node<T>),
}

struct Node<T> {
    elem: T,
    // next node towards front.
    to_front: Option<u32>,
    // next node towards back.
    to_back: Option<u32>,
}

impl<T> NodeQueue<T> {
    // construct empty queue.
    pub(crate) fn new() -> Self {
        NodeQueue {
            slots: Vec::new(),
            front_back: None,
            free: None,
            len: 0,
        }
    }

    // reserve slots for at least `additional` more nodes than are currently linked.
    pub(crate) fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let vacant = self.slots.len() - self.len;
        self.slots.try_reserve(additional.saturating_sub(vacant))
    }

    // number of linked nodes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    // whether no nodes are linked.
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    // link elem to the back of this queue.
    pub(crate) fn push_back(&mut self, elem: T) -> NodeKey {
        let to_front = self.front_back.map(|(_, back)| back);
        let key = self.alloc(Node { elem, to_front, to_back: None });
        match self.front_back {
            Some((front, back)) => {
                // node becomes new back, and new to_back of previous back
                self.node_mut(back).to_back = Some(key.idx);
                self.front_back = Some((front, key.idx));
            }
            // edge case: node becomes only node in queue
            None => self.front_back = Some((key.idx, key.idx)),
        }
        key
    }

    // link elem to the front of this queue.
    pub(crate) fn push_front(&mut self, elem: T) -> NodeKey {
        let to_back = self.front_back.map(|(front, _)| front);
        let key = self.alloc(Node { elem, to_front: None, to_back });
        match self.front_back {
            Some((front, back)) => {
                self.node_mut(front).to_front = Some(key.idx);
                self.front_back = Some((key.idx, back));
            }
            None => self.front_back = Some((key.idx, key.idx)),
        }
        key
    }

    // link elem directly towards the back of the node at `at`.
    //
    // panics if `at` is not linked into this queue.
    pub(crate) fn insert_after(&mut self, at: NodeKey, elem: T) -> NodeKey {
        let at_idx = self.resolve(at).expect("insert_after anchor is not linked (internal bug)");
        let to_back = self.node(at_idx).to_back;
        let key = self.alloc(Node { elem, to_front: Some(at_idx), to_back });
        self.node_mut(at_idx).to_back = Some(key.idx);
        match to_back {
            Some(next) => self.node_mut(next).to_front = Some(key.idx),
            None => {
                // edge case: anchor was the back
                let (front, _) = self.front_back.expect("non-empty queue without front (internal bug)");
                self.front_back = Some((front, key.idx));
            }
        }
        key
    }

    // unlink the node and return its elem, if the key still refers to a linked node.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<T> {
        let idx = self.resolve(key)?;
        Some(self.unlink(idx))
    }

    // unlink the node at the front of this queue.
    pub(crate) fn pop_front(&mut self) -> Option<T> {
        let (front, _) = self.front_back?;
        Some(self.unlink(front))
    }

    // borrow the elem at the front of this queue.
    pub(crate) fn front(&self) -> Option<&T> {
        self.front_back.map(|(front, _)| &self.node(front).elem)
    }

    // key of the node at the back of this queue.
    pub(crate) fn back_key(&self) -> Option<NodeKey> {
        self.front_back.map(|(_, back)| self.key_of(back))
    }

    // borrow the elem of a linked node.
    pub(crate) fn get(&self, key: NodeKey) -> Option<&T> {
        self.resolve(key).map(|idx| &self.node(idx).elem)
    }

    // key of the next node towards the front from a linked node.
    pub(crate) fn to_front(&self, key: NodeKey) -> Option<NodeKey> {
        let idx = self.resolve(key)?;
        self.node(idx).to_front.map(|idx| self.key_of(idx))
    }

    // iterate over elems from front to back.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut next = self.front_back.map(|(front, _)| front);
        iter::from_fn(move || {
            let node = self.node(next?);
            next = node.to_back;
            Some(&node.elem)
        })
    }

    fn resolve(&self, key: NodeKey) -> Option<u32> {
        let slot = self.slots.get(key.idx as usize)?;
        (slot.gen == key.gen && matches!(slot.entry, Entry::Occupied(_))).then_some(key.idx)
    }

    fn key_of(&self, idx: u32) -> NodeKey {
        NodeKey { idx, gen: self.slots[idx as usize].gen }
    }

    fn node(&self, idx: u32) -> &Node<T> {
        match &self.slots[idx as usize].entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => unreachable!("link to vacant slot (internal bug)"),
        }
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node<T> {
        match &mut self.slots[idx as usize].entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => unreachable!("link to vacant slot (internal bug)"),
        }
    }

    // place node in a vacant slot, growing the slab if there is none.
    fn alloc(&mut self, node: Node<T>) -> NodeKey {
        self.len += 1;
        if let Some(idx) = self.free {
            let slot = &mut self.slots[idx as usize];
            self.free = match slot.entry {
                Entry::Vacant { next_free } => next_free,
                Entry::Occupied(_) => unreachable!("free chain reached occupied slot (internal bug)"),
            };
            slot.entry = Entry::Occupied(node);
            NodeKey { idx, gen: slot.gen }
        } else {
            let idx = u32::try_from(self.slots.len()).expect("node queue slot count overflowed u32");
            self.slots.push(Slot { gen: 0, entry: Entry::Occupied(node) });
            NodeKey { idx, gen: 0 }
        }
    }

    // unlink a linked node, vacate its slot, and return its elem.
    fn unlink(&mut self, idx: u32) -> T {
        let (front, back) = self.front_back.expect("unlink from empty queue (internal bug)");

        self.len -= 1;
        let slot = &mut self.slots[idx as usize];
        slot.gen = slot.gen.wrapping_add(1);
        let entry = replace(&mut slot.entry, Entry::Vacant { next_free: self.free });
        self.free = Some(idx);
        let Entry::Occupied(node) = entry else {
            unreachable!("unlink of vacant slot (internal bug)");
        };

        match node.to_front {
            Some(prev) => self.node_mut(prev).to_back = node.to_back,
            None => debug_assert_eq!(front, idx),
        }
        match node.to_back {
            Some(next) => self.node_mut(next).to_front = node.to_front,
            None => debug_assert_eq!(back, idx),
        }
        let front = if node.to_front.is_none() { node.to_back } else { Some(front) };
        let back = if node.to_back.is_none() { node.to_front } else { Some(back) };
        self.front_back = front.zip(back);

        node.elem
    }
}

impl<T> Default for NodeQueue<T> {
    fn default() -> Self {
        NodeQueue::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::collections::VecDeque;

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes())
    }

    fn contents(queue: &NodeQueue<u32>) -> Vec<u32> {
        queue.iter().copied().collect()
    }

    #[test]
    fn push_pop_order() {
        let mut queue = NodeQueue::new();
        queue.push_back(2);
        queue.push_back(3);
        queue.push_front(1);
        assert_eq!(contents(&queue), [1, 2, 3]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.pop_front(), Some(3));
        assert_eq!(queue.pop_front(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_key_never_aliases() {
        let mut queue = NodeQueue::new();
        let a = queue.push_back(1);
        assert_eq!(queue.remove(a), Some(1));
        // slot gets reused by the next push
        let b = queue.push_back(2);
        assert_eq!(queue.get(a), None);
        assert_eq!(queue.remove(a), None);
        assert_eq!(queue.get(b), Some(&2));
    }

    #[test]
    fn insert_after_and_walk_to_front() {
        let mut queue = NodeQueue::new();
        let a = queue.push_back(10);
        let c = queue.push_back(30);
        let b = queue.insert_after(a, 20);
        let d = queue.insert_after(c, 40);
        assert_eq!(contents(&queue), [10, 20, 30, 40]);
        assert_eq!(queue.back_key(), Some(d));
        assert_eq!(queue.to_front(d), Some(c));
        assert_eq!(queue.to_front(c), Some(b));
        assert_eq!(queue.to_front(b), Some(a));
        assert_eq!(queue.to_front(a), None);
        assert_eq!(queue.remove(b), Some(20));
        assert_eq!(queue.to_front(c), Some(a));
        assert_eq!(contents(&queue), [10, 30, 40]);
        assert_eq!(queue.pop_front(), Some(10));
        assert_eq!(queue.pop_front(), Some(30));
        assert_eq!(queue.pop_front(), Some(40));
        assert_eq!(queue.back_key(), None);
    }

    #[test]
    fn reserve_counts_vacant_slots() {
        let mut queue = NodeQueue::<u32>::new();
        queue.try_reserve(8).unwrap();
        for i in 0..8 {
            queue.push_back(i);
        }
        while queue.pop_front().is_some() {}
        // eight vacant slots are already there
        queue.try_reserve(8).unwrap();
        assert_eq!(queue.slots.len(), 8);
    }

    #[test]
    fn equivalent_to_vec_deque() {
        let mut rng = new_rng();

        for _ in 0..20 {
            let mut model = VecDeque::<(u32, NodeKey)>::new();
            let mut queue = NodeQueue::<u32>::new();
            for i in 0u32..5_000 {
                let roll = rng.gen_range(0..100);
                if roll < 45 {
                    let key = queue.push_back(i);
                    model.push_back((i, key));
                } else if roll < 55 {
                    let key = queue.push_front(i);
                    model.push_front((i, key));
                } else if roll < 80 {
                    assert_eq!(queue.pop_front(), model.pop_front().map(|(elem, _)| elem));
                } else if !model.is_empty() {
                    // remove from the middle by key
                    let at = rng.gen_range(0..model.len());
                    let (elem, key) = model.remove(at).unwrap();
                    assert_eq!(queue.remove(key), Some(elem));
                    assert_eq!(queue.remove(key), None);
                }
                assert_eq!(queue.len(), model.len());
                assert_eq!(queue.front(), model.front().map(|(elem, _)| elem));
            }
            let expect = model.iter().map(|&(elem, _)| elem).collect::<Vec<_>>();
            assert_eq!(contents(&queue), expect);
        }
    }
}
