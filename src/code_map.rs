//! Map of generated code blocks, for symbolizing profiler samples.
//!
//! Blocks are keyed by start address. A lookup finds the block whose
//! `[start, start + size)` range contains an address, then maps the offset
//! within the block to a source position.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodeKind {
    ByteCode,
    JitCode,
    WasmCode,
}

/// One generated code block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeBlockInfo {
    pub size: usize,
    pub kind: CodeKind,
    pub name: String,
    /// `(instruction_offset, source_offset)`, sorted by instruction offset.
    mapping: Vec<(usize, usize)>,
}

impl CodeBlockInfo {
    pub fn new(size: usize, kind: CodeKind, name: impl Into<String>) -> Self {
        Self {
            size,
            kind,
            name: name.into(),
            mapping: Vec::new(),
        }
    }

    /// Record a position mapping. Keeps the table sorted.
    pub fn add_position(&mut self, instruction_offset: usize, source_offset: usize) {
        match self
            .mapping
            .binary_search_by_key(&instruction_offset, |(offset, _)| *offset)
        {
            Ok(i) => self.mapping[i].1 = source_offset,
            Err(i) => self.mapping.insert(i, (instruction_offset, source_offset)),
        }
    }

    pub fn with_positions(mut self, positions: impl IntoIterator<Item = (usize, usize)>) -> Self {
        for (instruction, source) in positions {
            self.add_position(instruction, source);
        }
        self
    }

    /// Source offset of the last mapping at or before `instruction_offset`.
    pub fn source_offset(&self, instruction_offset: usize) -> Option<usize> {
        let idx = self
            .mapping
            .partition_point(|(offset, _)| *offset <= instruction_offset);

        idx.checked_sub(1).map(|i| self.mapping[i].1)
    }

    pub fn positions(&self) -> &[(usize, usize)] {
        &self.mapping
    }
}

/// Code blocks ordered by start address.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    blocks: BTreeMap<usize, CodeBlockInfo>,
}

impl CodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block. Replaces any block starting at the same address.
    pub fn insert(&mut self, start: usize, info: CodeBlockInfo) -> Option<CodeBlockInfo> {
        self.blocks.insert(start, info)
    }

    pub fn remove(&mut self, start: usize) -> Option<CodeBlockInfo> {
        self.blocks.remove(&start)
    }

    /// The engine relocated a block (e.g. during compaction).
    pub fn move_block(&mut self, from: usize, to: usize) -> bool {
        match self.blocks.remove(&from) {
            Some(info) => {
                self.blocks.insert(to, info);
                true
            }
            None => false,
        }
    }

    /// Block containing `address`, with its start address.
    pub fn lookup(&self, address: usize) -> Option<(usize, &CodeBlockInfo)> {
        let (start, info) = self
            .blocks
            .range((Bound::Unbounded, Bound::Included(address)))
            .next_back()?;

        if address - start < info.size {
            Some((*start, info))
        } else {
            None
        }
    }

    /// Symbol name and source offset for `address`.
    pub fn source_position(&self, address: usize) -> Option<(&str, Option<usize>)> {
        let (start, info) = self.lookup(address)?;
        Some((info.name.as_str(), info.source_offset(address - start)))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
