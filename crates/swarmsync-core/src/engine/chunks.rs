//! Chunk pool - exclusive assignment of fixed-size byte ranges to sources
//!
//! A chunk is `Needed`, `Pending` (claimed by exactly one source) or
//! `Available` (written to the partial file). The pool itself is plain data;
//! the swarm wraps it in a mutex so every claim is serialized.

use swarmsync_types::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Needed,
    Pending(PeerId),
    Available,
}

/// Byte range of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPool {
    file_size: u64,
    chunk_size: u64,
    states: Vec<ChunkState>,
}

impl ChunkPool {
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let count = file_size.div_ceil(chunk_size) as usize;
        Self {
            file_size,
            chunk_size,
            states: vec![ChunkState::Needed; count],
        }
    }

    /// Restore from a bitmap of `'1'` (available) and `'0'` (needed).
    /// A bitmap of the wrong length is ignored.
    pub fn from_bitmap(file_size: u64, chunk_size: u64, bitmap: &str) -> Self {
        let mut pool = Self::new(file_size, chunk_size);
        if bitmap.len() == pool.states.len() {
            for (state, bit) in pool.states.iter_mut().zip(bitmap.bytes()) {
                if bit == b'1' {
                    *state = ChunkState::Available;
                }
            }
        }
        pool
    }

    /// Pending chunks are saved as needed
    pub fn to_bitmap(&self) -> String {
        self.states
            .iter()
            .map(|s| if *s == ChunkState::Available { '1' } else { '0' })
            .collect()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, index: usize) -> Option<&ChunkState> {
        self.states.get(index)
    }

    pub fn range(&self, index: usize) -> ChunkRange {
        let offset = index as u64 * self.chunk_size;
        ChunkRange {
            index,
            offset,
            length: self.chunk_size.min(self.file_size.saturating_sub(offset)),
        }
    }

    /// Index of the chunk containing byte `offset`
    pub fn index_of(&self, offset: u64) -> usize {
        (offset / self.chunk_size) as usize
    }

    /// Claim the next needed chunk for `peer`
    pub fn claim(&mut self, peer: &PeerId) -> Option<ChunkRange> {
        let index = self.states.iter().position(|s| *s == ChunkState::Needed)?;
        self.states[index] = ChunkState::Pending(peer.clone());
        Some(self.range(index))
    }

    /// Claim until `peer` has `max_outstanding` chunks pending
    pub fn claim_up_to(&mut self, peer: &PeerId, max_outstanding: usize) -> Vec<ChunkRange> {
        let held = self.pending_for(peer).len();
        let mut claimed = Vec::new();
        while held + claimed.len() < max_outstanding {
            match self.claim(peer) {
                Some(range) => claimed.push(range),
                None => break,
            }
        }
        claimed
    }

    /// Claim every needed chunk, used for whole-file streaming
    pub fn claim_all(&mut self, peer: &PeerId) -> Vec<ChunkRange> {
        let mut claimed = Vec::new();
        while let Some(range) = self.claim(peer) {
            claimed.push(range);
        }
        claimed
    }

    /// Pending(peer) -> Available. False if the chunk is not held by `peer`.
    pub fn mark_received(&mut self, index: usize, peer: &PeerId) -> bool {
        match self.states.get_mut(index) {
            Some(state) if *state == ChunkState::Pending(peer.clone()) => {
                *state = ChunkState::Available;
                true
            }
            _ => false,
        }
    }

    /// Pending(peer) -> Needed
    pub fn release(&mut self, index: usize, peer: &PeerId) -> bool {
        match self.states.get_mut(index) {
            Some(state) if *state == ChunkState::Pending(peer.clone()) => {
                *state = ChunkState::Needed;
                true
            }
            _ => false,
        }
    }

    /// Return every chunk pending on `peer` to the pool
    pub fn reclaim_from(&mut self, peer: &PeerId) -> Vec<usize> {
        let mut reclaimed = Vec::new();
        for (index, state) in self.states.iter_mut().enumerate() {
            if matches!(state, ChunkState::Pending(p) if p == peer) {
                *state = ChunkState::Needed;
                reclaimed.push(index);
            }
        }
        reclaimed
    }

    /// Chunk content is already present (resume or delta reuse)
    pub fn mark_available(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = ChunkState::Available;
        }
    }

    /// Chunk failed verification and must be fetched again
    pub fn mark_needed(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = ChunkState::Needed;
        }
    }

    pub fn pending_for(&self, peer: &PeerId) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, ChunkState::Pending(p) if p == peer))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn needed_count(&self) -> usize {
        self.count(|s| *s == ChunkState::Needed)
    }

    pub fn pending_count(&self) -> usize {
        self.count(|s| matches!(s, ChunkState::Pending(_)))
    }

    pub fn available_count(&self) -> usize {
        self.count(|s| *s == ChunkState::Available)
    }

    pub fn available_bytes(&self) -> u64 {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == ChunkState::Available)
            .map(|(i, _)| self.range(i).length)
            .sum()
    }

    pub fn has_needed(&self) -> bool {
        self.states.iter().any(|s| *s == ChunkState::Needed)
    }

    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| *s == ChunkState::Available)
    }

    /// Offset of the first chunk that is not yet available
    pub fn first_missing_offset(&self) -> Option<u64> {
        self.states
            .iter()
            .position(|s| *s != ChunkState::Available)
            .map(|i| self.range(i).offset)
    }

    fn count(&self, pred: impl Fn(&ChunkState) -> bool) -> usize {
        self.states.iter().filter(|s| pred(s)).count()
    }
}
