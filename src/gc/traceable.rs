//! GcTraceable trait and heap graph building for memory snapshots.

use std::sync::Arc;

use serde::Serialize;

use super::{ExternalMemoryAdjustment, ExternalMemoryTarget};

/// Trait for types that can report their external memory size to V8.
///
/// Implement this trait for types that hold significant amounts of memory
/// that V8 doesn't know about (Rust allocations, file handles, etc.).
/// Every `Resource` implements it; the size shows up in heap snapshots.
///
/// # Example
///
/// ```ignore
/// #[derive(GcTraceable)]
/// struct ImageBuffer {
///     #[gc(track)]
///     pixels: Vec<u8>,
///     #[gc(track)]
///     metadata: String,
///     // Fields without #[gc(track)] are not counted
///     width: u32,
///     height: u32,
/// }
/// ```
pub trait GcTraceable {
    /// Returns the size in bytes of external memory held by this value.
    ///
    /// This should include:
    /// - Heap allocations (Vec capacity, String capacity, HashMap entries, etc.)
    /// - Memory-mapped files
    /// - Native handles with associated memory
    ///
    /// This should NOT include:
    /// - The size of `self` (stack/inline size)
    /// - V8-managed memory (already tracked)
    fn external_memory_size(&self) -> usize;
}

// Implementations for common types

impl GcTraceable for Vec<u8> {
    fn external_memory_size(&self) -> usize {
        self.capacity()
    }
}

impl GcTraceable for String {
    fn external_memory_size(&self) -> usize {
        self.capacity()
    }
}

impl GcTraceable for bytes::Bytes {
    fn external_memory_size(&self) -> usize {
        // Backing memory might be shared; report the visible length
        self.len()
    }
}

impl<T: GcTraceable> GcTraceable for Option<T> {
    fn external_memory_size(&self) -> usize {
        self.as_ref().map(|v| v.external_memory_size()).unwrap_or(0)
    }
}

impl<T: GcTraceable> GcTraceable for Box<T> {
    fn external_memory_size(&self) -> usize {
        std::mem::size_of::<T>() + (**self).external_memory_size()
    }
}

impl<T: GcTraceable> GcTraceable for Arc<T> {
    fn external_memory_size(&self) -> usize {
        // Only count if we're the only reference
        if Arc::strong_count(self) == 1 {
            std::mem::size_of::<T>() + (**self).external_memory_size()
        } else {
            0
        }
    }
}

impl<T: GcTraceable> GcTraceable for Vec<T> {
    fn external_memory_size(&self) -> usize {
        let base = self.capacity() * std::mem::size_of::<T>();
        let contents: usize = self.iter().map(|v| v.external_memory_size()).sum();
        base + contents
    }
}

/// Create an adjustment sized by a value's external memory.
pub fn tracked_adjustment<T: GcTraceable>(
    target: &Arc<ExternalMemoryTarget>,
    value: &T,
) -> ExternalMemoryAdjustment {
    target.adjustment(value.external_memory_size())
}

/// A value paired with the adjustment reporting its external memory.
///
/// # Example
///
/// ```ignore
/// let mut tracked = Tracked::new(&target, vec![0u8; 1024]);
/// // V8 learns about 1024 bytes on the next lock
///
/// tracked.get_mut().resize(2048, 0);
/// tracked.update_size();
/// ```
pub struct Tracked<T: GcTraceable> {
    value: T,
    adjustment: ExternalMemoryAdjustment,
}

impl<T: GcTraceable> Tracked<T> {
    pub fn new(target: &Arc<ExternalMemoryTarget>, value: T) -> Self {
        let adjustment = tracked_adjustment(target, &value);
        Self { value, adjustment }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutable access. Call `update_size()` afterwards.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Re-sync the reported size after mutating the value.
    pub fn update_size(&mut self) {
        self.adjustment.resize(self.value.external_memory_size());
    }

    pub fn tracked_bytes(&self) -> usize {
        self.adjustment.amount()
    }

    /// Consume and return the inner value, releasing the reported memory.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: GcTraceable> std::ops::Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: GcTraceable + std::fmt::Debug> std::fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("value", &self.value)
            .field("tracked_bytes", &self.adjustment.amount())
            .finish()
    }
}

/// A native object that shows up in heap snapshots.
pub trait MemoryRetainer {
    fn memory_name(&self) -> &'static str;

    /// Bytes owned by this object, including its external memory.
    fn self_size(&self) -> usize;

    /// Report owned children.
    fn memory_info(&self, _tracker: &mut MemoryTracker) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapNode {
    pub id: usize,
    pub name: String,
    pub self_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapEdge {
    pub from: usize,
    pub to: usize,
    pub name: String,
}

/// Directed graph of native objects, rooted at node 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeapSnapshot {
    pub nodes: Vec<HeapNode>,
    pub edges: Vec<HeapEdge>,
}

impl HeapSnapshot {
    pub fn root(&self) -> Option<&HeapNode> {
        self.nodes.first()
    }

    pub fn children_of(&self, id: usize) -> impl Iterator<Item = &HeapNode> {
        self.edges
            .iter()
            .filter(move |edge| edge.from == id)
            .filter_map(|edge| self.nodes.get(edge.to))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds a `HeapSnapshot` while walking retainers.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    snapshot: HeapSnapshot,
    parents: Vec<usize>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node as a child of the node currently being tracked.
    pub fn track_node(&mut self, edge_name: &str, name: &str, self_size: usize) -> usize {
        let id = self.snapshot.nodes.len();
        self.snapshot.nodes.push(HeapNode {
            id,
            name: name.to_string(),
            self_size,
        });

        if let Some(&parent) = self.parents.last() {
            self.snapshot.edges.push(HeapEdge {
                from: parent,
                to: id,
                name: edge_name.to_string(),
            });
        }

        id
    }

    /// Add a retainer and recurse into its children.
    pub fn track<R: MemoryRetainer + ?Sized>(&mut self, edge_name: &str, retainer: &R) -> usize {
        let id = self.track_node(edge_name, retainer.memory_name(), retainer.self_size());
        self.parents.push(id);
        retainer.memory_info(self);
        self.parents.pop();
        id
    }

    /// Run `f` with `id` as the parent of new nodes.
    pub fn with_parent(&mut self, id: usize, f: impl FnOnce(&mut Self)) {
        self.parents.push(id);
        f(self);
        self.parents.pop();
    }

    /// Overwrite a node's size (e.g. a root sized by its children).
    pub fn set_self_size(&mut self, id: usize, self_size: usize) {
        if let Some(node) = self.snapshot.nodes.get_mut(id) {
            node.self_size = self_size;
        }
    }

    pub fn finish(self) -> HeapSnapshot {
        self.snapshot
    }
}
