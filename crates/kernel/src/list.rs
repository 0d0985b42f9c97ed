//! Intrusive index-linked lists over [`ObjectPool`] slots.
//!
//! Nodes carry their own links, so membership costs no allocation and removal
//! is O(1). [`List`] is a doubly-linked FIFO used for ready buckets and wait
//! lists; [`DeltaList`] keeps nodes ordered by expiry with each node storing
//! the ticks remaining after its predecessor, so a tick only touches the head.

use crate::slots::ObjectPool;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Link {
    prev: Option<u16>,
    next: Option<u16>,
    linked: bool,
}

impl Link {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

pub(crate) trait Linked {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct List {
    head: Option<u16>,
    tail: Option<u16>,
    len: u16,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn front(&self) -> Option<u16> {
        self.head
    }

    /// Successor of `index`, for cursor walks that may unlink the current node.
    pub fn next_of<T: Linked>(nodes: &ObjectPool<T>, index: u16) -> Option<u16> {
        nodes.at(index).link().next
    }

    pub fn push_back<T: Linked>(&mut self, nodes: &mut ObjectPool<T>, index: u16) {
        self.insert_before(nodes, index, None);
    }

    pub fn push_front<T: Linked>(&mut self, nodes: &mut ObjectPool<T>, index: u16) {
        let head = self.head;
        self.insert_before(nodes, index, head);
    }

    /// Inserts keeping the list sorted by descending `key`; equal keys stay FIFO.
    pub fn insert_by<T: Linked, K: Ord>(
        &mut self,
        nodes: &mut ObjectPool<T>,
        index: u16,
        key: impl Fn(&T) -> K,
    ) {
        let new_key = key(nodes.at(index));
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if key(nodes.at(current)) < new_key {
                break;
            }
            cursor = nodes.at(current).link().next;
        }
        self.insert_before(nodes, index, cursor);
    }

    fn insert_before<T: Linked>(&mut self, nodes: &mut ObjectPool<T>, index: u16, before: Option<u16>) {
        debug_assert!(!nodes.at(index).link().linked, "node already linked");

        let prev = match before {
            Some(next) => nodes.at(next).link().prev,
            None => self.tail,
        };

        *nodes.at_mut(index).link_mut() = Link {
            prev,
            next: before,
            linked: true,
        };

        match prev {
            Some(p) => nodes.at_mut(p).link_mut().next = Some(index),
            None => self.head = Some(index),
        }
        match before {
            Some(n) => nodes.at_mut(n).link_mut().prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
    }

    /// Unlinks `index`; a node that is not linked is left untouched.
    pub fn remove<T: Linked>(&mut self, nodes: &mut ObjectPool<T>, index: u16) {
        let link = *nodes.at(index).link();
        if !link.linked {
            return;
        }

        match link.prev {
            Some(p) => nodes.at_mut(p).link_mut().next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => nodes.at_mut(n).link_mut().prev = link.prev,
            None => self.tail = link.prev,
        }
        *nodes.at_mut(index).link_mut() = Link::default();
        self.len -= 1;
    }

    pub fn pop_front<T: Linked>(&mut self, nodes: &mut ObjectPool<T>) -> Option<u16> {
        let head = self.head?;
        self.remove(nodes, head);
        Some(head)
    }

    pub fn iter<'a, T: Linked>(&self, nodes: &'a ObjectPool<T>) -> impl Iterator<Item = u16> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let current = cursor?;
            cursor = nodes.at(current).link().next;
            Some(current)
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DeltaLink {
    prev: Option<u16>,
    next: Option<u16>,
    delta: u32,
    linked: bool,
}

impl DeltaLink {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

pub(crate) trait DeltaLinked {
    fn delta_link(&self) -> &DeltaLink;
    fn delta_link_mut(&mut self) -> &mut DeltaLink;
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DeltaList {
    head: Option<u16>,
}

impl DeltaList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Inserts `index` to expire after `ticks` further calls to [`Self::tick`].
    /// Nodes with equal expiry keep insertion order.
    pub fn insert<T: DeltaLinked>(&mut self, nodes: &mut ObjectPool<T>, index: u16, ticks: u32) {
        debug_assert!(!nodes.at(index).delta_link().linked, "node already in a delta list");

        let mut remaining = ticks;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let delta = nodes.at(current).delta_link().delta;
            if remaining < delta {
                break;
            }
            remaining -= delta;
            prev = Some(current);
            cursor = nodes.at(current).delta_link().next;
        }

        *nodes.at_mut(index).delta_link_mut() = DeltaLink {
            prev,
            next: cursor,
            delta: remaining,
            linked: true,
        };
        match prev {
            Some(p) => nodes.at_mut(p).delta_link_mut().next = Some(index),
            None => self.head = Some(index),
        }
        if let Some(n) = cursor {
            let link = nodes.at_mut(n).delta_link_mut();
            link.prev = Some(index);
            link.delta -= remaining;
        }
    }

    pub fn remove<T: DeltaLinked>(&mut self, nodes: &mut ObjectPool<T>, index: u16) {
        let link = *nodes.at(index).delta_link();
        if !link.linked {
            return;
        }

        match link.prev {
            Some(p) => nodes.at_mut(p).delta_link_mut().next = link.next,
            None => self.head = link.next,
        }
        if let Some(n) = link.next {
            let next = nodes.at_mut(n).delta_link_mut();
            next.prev = link.prev;
            next.delta += link.delta;
        }
        *nodes.at_mut(index).delta_link_mut() = DeltaLink::default();
    }

    /// Advances time by one tick.
    pub fn tick<T: DeltaLinked>(&mut self, nodes: &mut ObjectPool<T>) {
        if let Some(head) = self.head {
            let link = nodes.at_mut(head).delta_link_mut();
            link.delta = link.delta.saturating_sub(1);
        }
    }

    /// Unlinks and returns the head if it has expired.
    pub fn pop_expired<T: DeltaLinked>(&mut self, nodes: &mut ObjectPool<T>) -> Option<u16> {
        let head = self.head?;
        if nodes.at(head).delta_link().delta != 0 {
            return None;
        }
        self.remove(nodes, head);
        Some(head)
    }

    /// Ticks left until `index` expires, or `None` if it is not in the list.
    pub fn remaining<T: DeltaLinked>(&self, nodes: &ObjectPool<T>, index: u16) -> Option<u32> {
        let mut total = 0u32;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let link = nodes.at(current).delta_link();
            total = total.saturating_add(link.delta);
            if current == index {
                return Some(total);
            }
            cursor = link.next;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node {
        weight: u8,
        link: Link,
        timer: DeltaLink,
    }

    impl Linked for Node {
        fn link(&self) -> &Link {
            &self.link
        }
        fn link_mut(&mut self) -> &mut Link {
            &mut self.link
        }
    }

    impl DeltaLinked for Node {
        fn delta_link(&self) -> &DeltaLink {
            &self.timer
        }
        fn delta_link_mut(&mut self) -> &mut DeltaLink {
            &mut self.timer
        }
    }

    fn pool(weights: &[u8]) -> (ObjectPool<Node>, alloc::vec::Vec<u16>) {
        let mut nodes = ObjectPool::with_capacity(weights.len());
        let ids = weights
            .iter()
            .map(|w| {
                nodes
                    .insert(Node {
                        weight: *w,
                        ..Node::default()
                    })
                    .unwrap()
                    .index()
            })
            .collect();
        (nodes, ids)
    }

    #[test]
    fn sorted_insert_is_fifo_within_equal_keys() {
        let (mut nodes, ids) = pool(&[5, 9, 5, 1, 9]);
        let mut list = List::new();
        for id in &ids {
            list.insert_by(&mut nodes, *id, |n| n.weight);
        }
        let order: alloc::vec::Vec<u16> = list.iter(&nodes).collect();
        assert_eq!(order, vec![ids[1], ids[4], ids[0], ids[2], ids[3]]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn remove_relinks_neighbours() {
        let (mut nodes, ids) = pool(&[0, 0, 0]);
        let mut list = List::new();
        for id in &ids {
            list.push_back(&mut nodes, *id);
        }
        list.remove(&mut nodes, ids[1]);
        assert!(!nodes.at(ids[1]).link.is_linked());
        assert_eq!(list.iter(&nodes).collect::<alloc::vec::Vec<_>>(), vec![ids[0], ids[2]]);

        list.push_front(&mut nodes, ids[1]);
        assert_eq!(list.pop_front(&mut nodes), Some(ids[1]));
        assert_eq!(list.pop_front(&mut nodes), Some(ids[0]));
        assert_eq!(list.pop_front(&mut nodes), Some(ids[2]));
        assert!(list.is_empty());
    }

    #[test]
    fn delta_list_expires_on_exact_tick() {
        let (mut nodes, ids) = pool(&[0, 0, 0]);
        let mut delays = DeltaList::new();
        delays.insert(&mut nodes, ids[0], 3);
        delays.insert(&mut nodes, ids[1], 1);
        delays.insert(&mut nodes, ids[2], 3);

        assert_eq!(delays.remaining(&nodes, ids[2]), Some(3));

        let mut expired = alloc::vec::Vec::new();
        for tick in 1..=3 {
            delays.tick(&mut nodes);
            while let Some(id) = delays.pop_expired(&mut nodes) {
                expired.push((tick, id));
            }
        }
        assert_eq!(expired, vec![(1, ids[1]), (3, ids[0]), (3, ids[2])]);
        assert!(delays.is_empty());
    }

    #[test]
    fn delta_removal_preserves_successor_deadline() {
        let (mut nodes, ids) = pool(&[0, 0]);
        let mut delays = DeltaList::new();
        delays.insert(&mut nodes, ids[0], 2);
        delays.insert(&mut nodes, ids[1], 5);
        delays.remove(&mut nodes, ids[0]);
        assert_eq!(delays.remaining(&nodes, ids[1]), Some(5));
    }
}
