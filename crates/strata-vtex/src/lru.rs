//! Arena-backed least-recently-used ordering.
//!
//! Entries live in a `Vec` and are addressed by a stable index handle. The
//! recency order is an intrusive doubly-linked list threaded through the
//! arena, so touching an entry or peeking the oldest one is O(1).

/// Stable index of an entry in an [`LruQueue`].
pub type LruHandle = usize;

#[derive(Debug, Clone)]
struct LruNode<T> {
    value: T,
    prev: Option<LruHandle>,
    next: Option<LruHandle>,
}

/// Fixed-membership queue ordered from least to most recently used.
#[derive(Debug, Clone)]
pub struct LruQueue<T> {
    nodes: Vec<LruNode<T>>,
    head: Option<LruHandle>,
    tail: Option<LruHandle>,
}

impl<T> Default for LruQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruQueue<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append `value` as the most recently used entry.
    pub fn push_back(&mut self, value: T) -> LruHandle {
        let handle = self.nodes.len();
        self.nodes.push(LruNode {
            value,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        handle
    }

    /// The least recently used entry.
    pub fn front(&self) -> Option<LruHandle> {
        self.head
    }

    /// The most recently used entry.
    pub fn back(&self) -> Option<LruHandle> {
        self.tail
    }

    /// Mark `handle` as most recently used. Returns `false` for unknown handles.
    pub fn touch(&mut self, handle: LruHandle) -> bool {
        if handle >= self.nodes.len() {
            return false;
        }
        if self.tail == Some(handle) {
            return true;
        }

        let (prev, next) = (self.nodes[handle].prev, self.nodes[handle].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            self.nodes[next].prev = prev;
        }

        self.nodes[handle].prev = self.tail;
        self.nodes[handle].next = None;
        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(handle);
        }
        self.tail = Some(handle);
        true
    }

    pub fn get(&self, handle: LruHandle) -> Option<&T> {
        self.nodes.get(handle).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, handle: LruHandle) -> Option<&mut T> {
        self.nodes.get_mut(handle).map(|node| &mut node.value)
    }

    /// Entries from least to most recently used.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Entries in arena (insertion) order, ignoring recency.
    pub fn values(&self) -> impl Iterator<Item = (LruHandle, &T)> {
        self.nodes.iter().enumerate().map(|(i, node)| (i, &node.value))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }
}

/// Iterator over an [`LruQueue`] from oldest to newest.
pub struct Iter<'a, T> {
    queue: &'a LruQueue<T>,
    cursor: Option<LruHandle>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (LruHandle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        let node = &self.queue.nodes[handle];
        self.cursor = node.next;
        Some((handle, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(queue: &LruQueue<char>) -> String {
        queue.iter().map(|(_, c)| *c).collect()
    }

    #[test]
    fn test_push_keeps_insertion_order() {
        let mut queue = LruQueue::new();
        for c in ['a', 'b', 'c'] {
            queue.push_back(c);
        }
        assert_eq!(order(&queue), "abc");
        assert_eq!(queue.front(), Some(0));
        assert_eq!(queue.back(), Some(2));
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut queue = LruQueue::new();
        let a = queue.push_back('a');
        let b = queue.push_back('b');
        queue.push_back('c');

        assert!(queue.touch(a));
        assert_eq!(order(&queue), "bca");
        assert_eq!(queue.front(), Some(b));

        // Middle entry.
        assert!(queue.touch(2));
        assert_eq!(order(&queue), "bac");

        // Already newest.
        assert!(queue.touch(2));
        assert_eq!(order(&queue), "bac");
    }

    #[test]
    fn test_touch_single_entry_and_unknown_handle() {
        let mut queue = LruQueue::new();
        let only = queue.push_back('x');
        assert!(queue.touch(only));
        assert_eq!(queue.front(), Some(only));
        assert_eq!(queue.back(), Some(only));
        assert!(!queue.touch(7));
    }

    #[test]
    fn test_repeated_front_rotation_cycles_all() {
        let mut queue = LruQueue::new();
        for c in ['a', 'b', 'c', 'd'] {
            queue.push_back(c);
        }
        let mut seen = String::new();
        for _ in 0..8 {
            let front = queue.front().unwrap();
            seen.push(*queue.get(front).unwrap());
            queue.touch(front);
        }
        assert_eq!(seen, "abcdabcd");
    }

    #[test]
    fn test_get_mut_updates_value() {
        let mut queue = LruQueue::new();
        let h = queue.push_back(1u32);
        *queue.get_mut(h).unwrap() += 41;
        assert_eq!(queue.get(h), Some(&42));
        assert_eq!(queue.get(5), None);
    }
}
