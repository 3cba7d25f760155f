//! Handles whose owning thread is blocked in a tracked call.
//!
//! Entries live in a slot arena threaded into a circular doubly linked list
//! by index, with slot 0 as the sentinel. Freed slots form a singly linked
//! free list through `next`. Register and unregister are O(1); a sweep walks
//! only the live entries. A single mutex orders all three operations.

use std::sync::{Mutex, MutexGuard};

use ocicancel_intercept::RawHandle;

const SENTINEL: u32 = 0;
const NIL: u32 = u32::MAX;

struct Node {
    handle: RawHandle,
    prev: u32,
    next: u32,
    generation: u32,
    live: bool,
}

impl Node {
    fn vacant() -> Self {
        Self {
            handle: RawHandle::default(),
            prev: SENTINEL,
            next: SENTINEL,
            generation: 0,
            live: false,
        }
    }
}

struct Slots {
    nodes: Vec<Node>,
    free: u32,
    len: usize,
}

impl Slots {
    const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: NIL,
            len: 0,
        }
    }

    fn node(&mut self, index: u32) -> &mut Node {
        &mut self.nodes[index as usize]
    }

    fn insert(&mut self, handle: RawHandle) -> Token {
        if self.nodes.is_empty() {
            self.nodes.push(Node::vacant());
        }

        let index = if self.free != NIL {
            let index = self.free;
            self.free = self.node(index).next;
            index
        } else {
            self.nodes.push(Node::vacant());
            (self.nodes.len() - 1) as u32
        };

        let head = self.node(SENTINEL).next;
        let node = self.node(index);
        node.handle = handle;
        node.prev = SENTINEL;
        node.next = head;
        node.live = true;
        let generation = node.generation;

        self.node(head).prev = index;
        self.node(SENTINEL).next = index;
        self.len += 1;

        Token { index, generation }
    }

    fn remove(&mut self, token: &Token) -> bool {
        if token.index == SENTINEL {
            return false;
        }
        let (prev, next) = match self.nodes.get(token.index as usize) {
            Some(node) if node.live && node.generation == token.generation => (node.prev, node.next),
            _ => return false,
        };

        self.node(prev).next = next;
        self.node(next).prev = prev;

        let free = self.free;
        let node = self.node(token.index);
        node.live = false;
        node.generation = node.generation.wrapping_add(1);
        node.prev = NIL;
        node.next = free;
        self.free = token.index;
        self.len -= 1;
        true
    }

    /// Live entries, most recently registered first.
    fn for_each(&self, mut f: impl FnMut(RawHandle)) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut visited = 0;
        let mut cursor = self.nodes[SENTINEL as usize].next;
        while cursor != SENTINEL {
            let node = &self.nodes[cursor as usize];
            f(node.handle);
            visited += 1;
            cursor = node.next;
        }
        visited
    }
}

/// Proof of one registration. Consumed by [`Registry::unregister`], so a
/// registration can be removed at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a registration stays live until its token is unregistered"]
pub struct Token {
    index: u32,
    generation: u32,
}

pub struct Registry {
    slots: Mutex<Slots>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that the calling thread is about to block on `handle`.
    pub fn register(&self, handle: RawHandle) -> Token {
        self.lock().insert(handle)
    }

    /// Drop a registration. Returns false if the token does not belong to
    /// a live entry of this registry.
    pub fn unregister(&self, token: Token) -> bool {
        self.lock().remove(&token)
    }

    /// Register `handle` for the lifetime of the returned guard.
    pub fn track(&self, handle: RawHandle) -> Tracked<'_> {
        Tracked {
            registry: self,
            handle,
            token: Some(self.register(handle)),
        }
    }

    /// Call `interrupt` once for every registered handle, holding the lock
    /// for the whole walk. Entries are left in place: each is removed by the
    /// thread that registered it once its call returns.
    ///
    /// Returns the number of handles visited. Does not allocate.
    pub fn for_each_and_interrupt(&self, interrupt: impl FnMut(RawHandle)) -> usize {
        self.lock().for_each(interrupt)
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        let mut found = false;
        self.lock().for_each(|h| found |= h == handle);
        found
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration: the handle is tracked until this guard drops.
#[must_use = "the handle is untracked as soon as the guard is dropped"]
pub struct Tracked<'a> {
    registry: &'a Registry,
    handle: RawHandle,
    token: Option<Token>,
}

impl Tracked<'_> {
    pub fn handle(&self) -> RawHandle {
        self.handle
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.registry.unregister(token);
        }
    }
}

static GLOBAL: Registry = Registry::new();

/// The registry shared by the instrumented wrappers and [`crate::interrupt_all`].
pub fn global() -> &'static Registry {
    &GLOBAL
}
