//! Packets waiting for ARP resolution
//!
//! A fixed arena of nodes linked by slot index. The first packet waiting on
//! an IP becomes a *root*; roots form a doubly-linked list with the newest at
//! the head. Further packets for the same IP are *children* chained off their
//! root, so looking up an IP costs one step per distinct pending IP rather
//! than one per packet. Unused nodes are threaded on a free list.

use super::buffer::BufferDescriptor;
use crate::TableError;
use std::net::Ipv4Addr;

/// Handle to an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Free,
    Root,
    Child,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    kind: NodeKind,
    ip: Ipv4Addr,
    buffer: BufferDescriptor,
    /// Root list: towards the tail. Free list: next free node.
    next: Option<usize>,
    /// Root list: towards the head.
    prev: Option<usize>,
    /// Roots: first child. Children: next child.
    child: Option<usize>,
    /// Roots only: last child, for O(1) append.
    last_child: Option<usize>,
}

impl Node {
    fn free(next: Option<usize>) -> Self {
        Self {
            kind: NodeKind::Free,
            ip: Ipv4Addr::UNSPECIFIED,
            buffer: BufferDescriptor { offset: 0, len: 0 },
            next,
            prev: None,
            child: None,
            last_child: None,
        }
    }
}

/// Arena of packets parked until their next hop resolves
#[derive(Debug)]
pub struct PendingPacketQueue {
    nodes: Vec<Node>,
    free_head: Option<usize>,
    free_len: usize,
    head: Option<usize>,
    tail: Option<usize>,
    roots: usize,
    size: usize,
}

impl PendingPacketQueue {
    pub fn new(capacity: usize) -> Self {
        let nodes = (0..capacity)
            .map(|i| Node::free((i + 1 < capacity).then_some(i + 1)))
            .collect();

        Self {
            nodes,
            free_head: (capacity > 0).then_some(0),
            free_len: capacity,
            head: None,
            tail: None,
            roots: 0,
            size: 0,
        }
    }

    fn alloc(&mut self, kind: NodeKind, ip: Ipv4Addr, buffer: BufferDescriptor) -> Option<usize> {
        let index = self.free_head?;
        self.free_head = self.nodes[index].next;
        self.free_len -= 1;
        self.nodes[index] = Node {
            kind,
            ip,
            buffer,
            next: None,
            prev: None,
            child: None,
            last_child: None,
        };
        Some(index)
    }

    fn release(&mut self, index: usize) {
        self.nodes[index] = Node::free(self.free_head);
        self.free_head = Some(index);
        self.free_len += 1;
    }

    /// Park `buffer` until `ip` resolves.
    ///
    /// Joins the existing root for `ip` as a child, or becomes a new root at
    /// the head of the root list. `Full` means the packet was not stored.
    pub fn push(&mut self, ip: Ipv4Addr, buffer: BufferDescriptor) -> Result<NodeId, TableError> {
        match self.find_node(ip) {
            Some(NodeId(root)) => {
                let child = self
                    .alloc(NodeKind::Child, ip, buffer)
                    .ok_or(TableError::Full)?;
                match self.nodes[root].last_child {
                    Some(last) => self.nodes[last].child = Some(child),
                    None => self.nodes[root].child = Some(child),
                }
                self.nodes[root].last_child = Some(child);
                self.size += 1;
                Ok(NodeId(child))
            }
            None => {
                let root = self
                    .alloc(NodeKind::Root, ip, buffer)
                    .ok_or(TableError::Full)?;
                self.nodes[root].next = self.head;
                match self.head {
                    Some(old_head) => self.nodes[old_head].prev = Some(root),
                    None => self.tail = Some(root),
                }
                self.head = Some(root);
                self.roots += 1;
                self.size += 1;
                Ok(NodeId(root))
            }
        }
    }

    /// Root for `ip`, scanning only the root list
    pub fn find_node(&self, ip: Ipv4Addr) -> Option<NodeId> {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            if node.ip == ip {
                return Some(NodeId(index));
            }
            cursor = node.next;
        }
        None
    }

    /// Release a root and its whole child chain, returning how many packets
    /// were released.
    pub fn free_parent(&mut self, root: NodeId) -> Result<usize, TableError> {
        let index = root.0;
        if self.nodes.get(index).map(|n| n.kind) != Some(NodeKind::Root) {
            return Err(TableError::InvalidId);
        }

        let Node {
            next, prev, child, ..
        } = self.nodes[index];

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        let mut freed = 1;
        let mut cursor = child;
        while let Some(child_index) = cursor {
            cursor = self.nodes[child_index].child;
            self.release(child_index);
            freed += 1;
        }
        self.release(index);

        self.roots -= 1;
        self.size -= freed;
        Ok(freed)
    }

    /// Take the oldest packet parked under `root`.
    ///
    /// The root keeps its slot (and its place in the root list) while
    /// children remain: the first child's buffer moves up into it. Taking
    /// the last packet unlinks the root. Returns the buffer and whether
    /// more packets are still waiting.
    pub fn pop_front(&mut self, root: NodeId) -> Result<(BufferDescriptor, bool), TableError> {
        let index = root.0;
        if self.nodes.get(index).map(|n| n.kind) != Some(NodeKind::Root) {
            return Err(TableError::InvalidId);
        }

        let buffer = self.nodes[index].buffer;
        let Some(first) = self.nodes[index].child else {
            self.free_parent(root)?;
            return Ok((buffer, false));
        };

        let Node { buffer: next_buffer, child: next_child, .. } = self.nodes[first];
        let node = &mut self.nodes[index];
        node.buffer = next_buffer;
        node.child = next_child;
        if next_child.is_none() {
            node.last_child = None;
        }
        self.release(first);
        self.size -= 1;
        Ok((buffer, true))
    }

    /// Buffers waiting under `root`, in arrival order. Empty if `root` is
    /// not a live root.
    pub fn packets(&self, root: NodeId) -> Packets<'_> {
        let cursor = match self.nodes.get(root.0) {
            Some(node) if node.kind == NodeKind::Root => Some(root.0),
            _ => None,
        };
        Packets {
            queue: self,
            cursor,
        }
    }

    /// IP a node is waiting on
    pub fn ip(&self, node: NodeId) -> Option<Ipv4Addr> {
        self.nodes
            .get(node.0)
            .filter(|n| n.kind != NodeKind::Free)
            .map(|n| n.ip)
    }

    /// Roots from newest to oldest
    pub fn roots(&self) -> Roots<'_> {
        Roots {
            queue: self,
            cursor: self.head,
        }
    }

    /// Oldest root (tail of the root list)
    pub fn oldest(&self) -> Option<NodeId> {
        self.tail.map(NodeId)
    }

    /// Total parked packets (roots and children)
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of distinct IPs waiting
    pub fn root_count(&self) -> usize {
        self.roots
    }

    pub fn free_len(&self) -> usize {
        self.free_len
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }
}

/// Iterator over the buffers under one root
pub struct Packets<'a> {
    queue: &'a PendingPacketQueue,
    cursor: Option<usize>,
}

impl Iterator for Packets<'_> {
    type Item = BufferDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.queue.nodes[self.cursor?];
        self.cursor = node.child;
        Some(node.buffer)
    }
}

/// Iterator over roots, newest first
pub struct Roots<'a> {
    queue: &'a PendingPacketQueue,
    cursor: Option<usize>,
}

impl Iterator for Roots<'_> {
    type Item = (NodeId, Ipv4Addr);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.queue.nodes[index];
        self.cursor = node.next;
        Some((NodeId(index), node.ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(n: usize) -> BufferDescriptor {
        BufferDescriptor {
            offset: n * 2048,
            len: 60,
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    /// Walk every link and check the counters agree with the structure.
    fn check_invariants(queue: &PendingPacketQueue) {
        assert_eq!(queue.len() + queue.free_len(), queue.capacity());

        let mut free = 0;
        let mut cursor = queue.free_head;
        while let Some(index) = cursor {
            assert_eq!(queue.nodes[index].kind, NodeKind::Free);
            free += 1;
            cursor = queue.nodes[index].next;
        }
        assert_eq!(free, queue.free_len());

        let mut roots = 0;
        let mut packets = 0;
        let mut prev = None;
        let mut cursor = queue.head;
        while let Some(index) = cursor {
            let node = &queue.nodes[index];
            assert_eq!(node.kind, NodeKind::Root);
            assert_eq!(node.prev, prev);
            roots += 1;
            packets += queue.packets(NodeId(index)).count();
            prev = Some(index);
            cursor = node.next;
        }
        assert_eq!(queue.tail, prev);
        assert_eq!(roots, queue.root_count());
        assert_eq!(packets, queue.len());

        let mut ips: Vec<_> = queue.roots().map(|(_, ip)| ip).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), roots, "one root per IP");
    }

    #[test]
    fn test_fan_out_under_one_root() {
        let mut queue = PendingPacketQueue::new(8);
        let root = queue.push(ip(1), buf(0)).unwrap();
        queue.push(ip(1), buf(1)).unwrap();
        queue.push(ip(1), buf(2)).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.root_count(), 1);
        assert_eq!(queue.find_node(ip(1)), Some(root));
        assert_eq!(
            queue.packets(root).collect::<Vec<_>>(),
            vec![buf(0), buf(1), buf(2)]
        );
        check_invariants(&queue);
    }

    #[test]
    fn test_free_parent_releases_whole_chain() {
        let mut queue = PendingPacketQueue::new(8);
        queue.push(ip(2), buf(0)).unwrap();
        for i in 1..=4 {
            queue.push(ip(1), buf(i)).unwrap();
        }
        check_invariants(&queue);
        let before = queue.len();

        let root = queue.find_node(ip(1)).unwrap();
        assert_eq!(queue.free_parent(root), Ok(4));

        assert_eq!(queue.len(), before - 4);
        assert_eq!(queue.root_count(), 1);
        assert_eq!(queue.find_node(ip(1)), None);
        assert!(queue.find_node(ip(2)).is_some());
        check_invariants(&queue);
    }

    #[test]
    fn test_roots_newest_first() {
        let mut queue = PendingPacketQueue::new(8);
        queue.push(ip(1), buf(0)).unwrap();
        queue.push(ip(2), buf(1)).unwrap();
        queue.push(ip(3), buf(2)).unwrap();

        let order: Vec<_> = queue.roots().map(|(_, ip)| ip).collect();
        assert_eq!(order, vec![ip(3), ip(2), ip(1)]);
        assert_eq!(queue.ip(queue.oldest().unwrap()), Some(ip(1)));
    }

    #[test]
    fn test_unlink_head_middle_tail() {
        let mut queue = PendingPacketQueue::new(8);
        for i in 1..=4 {
            queue.push(ip(i), buf(i as usize)).unwrap();
        }

        // middle
        queue.free_parent(queue.find_node(ip(2)).unwrap()).unwrap();
        check_invariants(&queue);
        // head (newest)
        queue.free_parent(queue.find_node(ip(4)).unwrap()).unwrap();
        check_invariants(&queue);
        // tail (oldest)
        queue.free_parent(queue.find_node(ip(1)).unwrap()).unwrap();
        check_invariants(&queue);

        let order: Vec<_> = queue.roots().map(|(_, ip)| ip).collect();
        assert_eq!(order, vec![ip(3)]);

        queue.free_parent(queue.find_node(ip(3)).unwrap()).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.oldest(), None);
        check_invariants(&queue);
    }

    #[test]
    fn test_full_rejects_root_and_child() {
        let mut queue = PendingPacketQueue::new(2);
        queue.push(ip(1), buf(0)).unwrap();
        queue.push(ip(1), buf(1)).unwrap();
        assert!(queue.is_full());

        assert_eq!(queue.push(ip(1), buf(2)), Err(TableError::Full));
        assert_eq!(queue.push(ip(2), buf(2)), Err(TableError::Full));
        assert_eq!(queue.len(), 2);
        check_invariants(&queue);
    }

    #[test]
    fn test_free_parent_rejects_non_root() {
        let mut queue = PendingPacketQueue::new(4);
        queue.push(ip(1), buf(0)).unwrap();
        let child = queue.push(ip(1), buf(1)).unwrap();

        assert_eq!(queue.free_parent(child), Err(TableError::InvalidId));
        assert_eq!(queue.free_parent(NodeId(3)), Err(TableError::InvalidId));
        assert_eq!(queue.free_parent(NodeId(99)), Err(TableError::InvalidId));
        check_invariants(&queue);
    }

    #[test]
    fn test_nodes_are_recycled() {
        let mut queue = PendingPacketQueue::new(3);
        for round in 0..10 {
            for i in 0..3 {
                queue.push(ip(round), buf(i)).unwrap();
            }
            let root = queue.find_node(ip(round)).unwrap();
            assert_eq!(queue.free_parent(root), Ok(3));
            check_invariants(&queue);
        }
        assert_eq!(queue.free_len(), 3);
    }

    #[test]
    fn test_pop_front_in_arrival_order() {
        let mut queue = PendingPacketQueue::new(8);
        queue.push(ip(2), buf(7)).unwrap();
        let root = queue.push(ip(1), buf(0)).unwrap();
        queue.push(ip(1), buf(1)).unwrap();
        queue.push(ip(1), buf(2)).unwrap();

        assert_eq!(queue.pop_front(root), Ok((buf(0), true)));
        check_invariants(&queue);
        assert_eq!(queue.find_node(ip(1)), Some(root));
        assert_eq!(queue.packets(root).collect::<Vec<_>>(), vec![buf(1), buf(2)]);

        // Appending after a pop still lands at the back
        queue.push(ip(1), buf(3)).unwrap();
        assert_eq!(queue.pop_front(root), Ok((buf(1), true)));
        assert_eq!(queue.pop_front(root), Ok((buf(2), true)));
        check_invariants(&queue);
        assert_eq!(queue.pop_front(root), Ok((buf(3), false)));

        assert_eq!(queue.find_node(ip(1)), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_front(root), Err(TableError::InvalidId));
        check_invariants(&queue);
    }

    #[test]
    fn test_zero_capacity() {
        let mut queue = PendingPacketQueue::new(0);
        assert_eq!(queue.push(ip(1), buf(0)), Err(TableError::Full));
        check_invariants(&queue);
    }
}
