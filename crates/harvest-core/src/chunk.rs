//! Fixed-size partitioning of the work index space.
//!
//! A [`Chunk`] is a half-open range `[start, end)` over the work source.
//! Its [`ChunkId`] is derived from `start` alone, so re-partitioning the
//! same range with the same chunk size always yields the same ids.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Stable identifier of a chunk, derived from its start index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn from_start(start: u64) -> Self {
        Self(start)
    }

    pub fn start(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{:012}", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("chunk-")
            .and_then(|n| n.parse::<u64>().ok())
            .map(ChunkId)
            .ok_or_else(|| format!("Invalid chunk id: {s}"))
    }
}

/// A contiguous half-open range of work indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn id(&self) -> ChunkId {
        ChunkId::from_start(self.start)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The part of this chunk still to process when everything below
    /// `resume_index` is already persisted. `None` if nothing is left.
    pub fn remaining_from(&self, resume_index: u64) -> Option<Range<u64>> {
        let start = self.start.max(resume_index);
        (start < self.end).then_some(start..self.end)
    }
}

/// Lifecycle of a chunk as recorded in the chunk ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in-progress",
            ChunkStatus::Done => "done",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Done | ChunkStatus::Failed)
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ChunkStatus::Pending),
            "in-progress" | "in_progress" => Ok(ChunkStatus::InProgress),
            "done" => Ok(ChunkStatus::Done),
            "failed" => Ok(ChunkStatus::Failed),
            _ => Err(format!("Unknown chunk status: {}", s)),
        }
    }
}

/// Partition `[start, end)` into contiguous chunks of `chunk_size`.
///
/// The returned iterator is lazy; calling again with the same arguments
/// replays the same sequence.
pub fn partition(start: u64, end: u64, chunk_size: u64) -> Result<Chunks, AppError> {
    if chunk_size == 0 {
        return Err(AppError::ConfigError(
            "chunk size must be at least 1".into(),
        ));
    }
    if start > end {
        return Err(AppError::ConfigError(format!(
            "invalid partition range: start {start} is past end {end}"
        )));
    }
    Ok(Chunks {
        next: start,
        end,
        chunk_size,
    })
}

/// Lazy, deterministic chunk sequence produced by [`partition`].
#[derive(Debug, Clone)]
pub struct Chunks {
    next: u64,
    end: u64,
    chunk_size: u64,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.chunk_size).min(self.end);
        self.next = end;
        Some(Chunk::new(start, end))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.end - self.next.min(self.end)).div_ceil(self.chunk_size);
        let left = usize::try_from(left).unwrap_or(usize::MAX);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks {}
