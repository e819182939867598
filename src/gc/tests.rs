//! Tests for GC tracking.

use super::*;
use crate::GcTraceable as DeriveGcTraceable;

// Derive macro (using crate_path for internal usage)
#[derive(DeriveGcTraceable)]
#[gc(crate_path = "crate")]
struct TestBuffer {
    #[gc(track)]
    data: Vec<u8>,
    #[gc(track)]
    name: String,
    // Not tracked
    #[allow(dead_code)]
    id: u64,
}

#[test]
fn test_derive_gc_traceable() {
    let buffer = TestBuffer {
        data: Vec::with_capacity(1000),
        name: String::with_capacity(100),
        id: 42,
    };

    // Only data (1000) + name (100), not id
    assert_eq!(buffer.external_memory_size(), 1100);
}

#[derive(DeriveGcTraceable)]
#[gc(crate_path = "crate")]
struct EmptyStruct {
    #[allow(dead_code)]
    value: u64,
}

#[test]
fn test_derive_gc_traceable_no_tracked_fields() {
    let empty = EmptyStruct { value: 123 };
    assert_eq!(empty.external_memory_size(), 0);
}

#[derive(DeriveGcTraceable)]
#[gc(crate_path = "crate")]
#[allow(dead_code)]
enum Body {
    Empty,
    Inline(#[gc(track)] Vec<u8>, u32),
    Named {
        #[gc(track)]
        text: String,
        offset: usize,
    },
}

#[test]
fn test_derive_gc_traceable_enum() {
    assert_eq!(Body::Empty.external_memory_size(), 0);
    assert_eq!(Body::Inline(Vec::with_capacity(64), 7).external_memory_size(), 64);

    let named = Body::Named {
        text: String::with_capacity(32),
        offset: 3,
    };
    assert_eq!(named.external_memory_size(), 32);
}

#[test]
fn test_gc_traceable_option() {
    let some: Option<Vec<u8>> = Some(Vec::with_capacity(100));
    let none: Option<Vec<u8>> = None;

    assert_eq!(some.external_memory_size(), 100);
    assert_eq!(none.external_memory_size(), 0);
}

#[test]
fn test_gc_traceable_nested_vec() {
    let v: Vec<Vec<u8>> = vec![
        Vec::with_capacity(100),
        Vec::with_capacity(200),
        Vec::with_capacity(300),
    ];

    let base = v.capacity() * std::mem::size_of::<Vec<u8>>();
    assert_eq!(v.external_memory_size(), base + 600);
}

#[test]
fn test_tracked_reports_to_target() {
    let target = ExternalMemoryTarget::new(7);

    let tracked = Tracked::new(&target, Vec::<u8>::with_capacity(256));
    assert_eq!(tracked.tracked_bytes(), 256);
    assert_eq!(target.pending(), 256);

    drop(tracked);
    assert_eq!(target.pending(), 0);
}

#[test]
fn test_tracked_update_size() {
    let target = ExternalMemoryTarget::new(7);
    let mut tracked = Tracked::new(&target, Vec::<u8>::with_capacity(100));

    tracked.get_mut().reserve_exact(1000);
    tracked.update_size();

    let capacity = tracked.get().capacity();
    assert_eq!(tracked.tracked_bytes(), capacity);
    assert_eq!(target.pending(), capacity as i64);

    let inner = tracked.into_inner();
    assert_eq!(inner.capacity(), capacity);
    assert_eq!(target.pending(), 0);
}

struct Node {
    name: &'static str,
    size: usize,
    children: Vec<Node>,
}

impl MemoryRetainer for Node {
    fn memory_name(&self) -> &'static str {
        self.name
    }

    fn self_size(&self) -> usize {
        self.size
    }

    fn memory_info(&self, tracker: &mut MemoryTracker) {
        for child in &self.children {
            tracker.track("child", child);
        }
    }
}

#[test]
fn test_memory_tracker_builds_graph() {
    let tree = Node {
        name: "Root",
        size: 10,
        children: vec![
            Node {
                name: "Left",
                size: 4,
                children: vec![],
            },
            Node {
                name: "Right",
                size: 6,
                children: vec![Node {
                    name: "Leaf",
                    size: 1,
                    children: vec![],
                }],
            },
        ],
    };

    let mut tracker = MemoryTracker::new();
    let root = tracker.track("root", &tree);
    let snapshot = tracker.finish();

    assert_eq!(root, 0);
    assert_eq!(snapshot.nodes.len(), 4);
    assert_eq!(snapshot.edges.len(), 3);
    assert_eq!(snapshot.root().map(|n| n.name.as_str()), Some("Root"));

    let children: Vec<_> = snapshot.children_of(0).map(|n| n.name.as_str()).collect();
    assert_eq!(children, vec!["Left", "Right"]);

    let json = snapshot.to_json().unwrap();
    assert!(json.contains("\"Leaf\""));
}
