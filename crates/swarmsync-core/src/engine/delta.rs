//! Block signatures and delta matching
//!
//! A `PartsRecord` lists weak (rolling, Adler-style) and strong (SHA-256)
//! checksums for every block of a file version. Scanning stale local data
//! with a rolling window finds blocks of the new version that are already
//! present, at any offset, so they can be copied instead of downloaded.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use swarmsync_types::{BlockDigest, PartsRecord};
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const READ_BUFFER: usize = 64 * 1024;

/// Adler-style checksum over a sliding window of `block_size` bytes
#[derive(Debug, Clone)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    window: Vec<u8>,
    /// Next write position, also the start of the window once it is full
    head: usize,
    filled: usize,
}

impl RollingChecksum {
    pub fn new(block_size: usize) -> Self {
        Self {
            a: 1,
            b: 0,
            window: vec![0; block_size.max(1)],
            head: 0,
            filled: 0,
        }
    }

    pub fn reset(&mut self) {
        self.a = 1;
        self.b = 0;
        self.head = 0;
        self.filled = 0;
    }

    pub fn push(&mut self, byte: u8) {
        let size = self.window.len();
        if self.filled == size {
            let old = self.window[self.head] as u32;
            self.a = self.a.wrapping_add(byte as u32).wrapping_sub(old);
            self.b = self
                .b
                .wrapping_add(self.a)
                .wrapping_sub((size as u32).wrapping_mul(old))
                .wrapping_sub(1);
        } else {
            self.a = self.a.wrapping_add(byte as u32);
            self.b = self.b.wrapping_add(self.a);
            self.filled += 1;
        }
        self.window[self.head] = byte;
        self.head = (self.head + 1) % size;
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.window.len()
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | (self.a & 0xffff)
    }

    /// SHA-256 of the window in stream order
    pub fn window_hash(&self) -> String {
        let mut hasher = Sha256::new();
        if self.is_full() {
            hasher.update(&self.window[self.head..]);
            hasher.update(&self.window[..self.head]);
        } else {
            hasher.update(&self.window[..self.filled]);
        }
        hex::encode(hasher.finalize())
    }
}

pub fn weak_checksum(data: &[u8]) -> u32 {
    let mut rolling = RollingChecksum::new(data.len());
    for &byte in data {
        rolling.push(byte);
    }
    rolling.value()
}

pub fn strong_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn digest_block(data: &[u8]) -> BlockDigest {
    BlockDigest {
        weak: weak_checksum(data),
        strong: strong_hash(data),
    }
}

/// SHA-256 of a whole file
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of `length` bytes starting at `offset`
pub async fn hash_range(file: &mut File, offset: u64, length: u64) -> io::Result<String> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut hasher = Sha256::new();
    let mut remaining = length;
    let mut buf = vec![0u8; READ_BUFFER];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "range extends past end of file",
            ));
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Build the parts record of a local file
pub async fn parts_record_for(path: &Path, block_size: u64) -> io::Result<PartsRecord> {
    let block_size = block_size.max(1);
    let mut file = File::open(path).await?;
    let file_length = file.metadata().await?.len();
    let mut blocks = Vec::with_capacity(file_length.div_ceil(block_size) as usize);
    let mut block = vec![0u8; block_size as usize];

    loop {
        let mut filled = 0;
        while filled < block.len() {
            let n = file.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        blocks.push(digest_block(&block[..filled]));
        if filled < block.len() {
            break;
        }
    }

    Ok(PartsRecord {
        block_size,
        file_length,
        blocks,
    })
}

/// A block of the target version found in the scanned data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    pub block: usize,
    pub source_offset: u64,
}

/// Scan `reader` for blocks of `record`.
///
/// Full-size blocks are found at any offset. A short final block is only
/// checked at its own offset.
pub async fn find_matches<R>(record: &PartsRecord, mut reader: R) -> io::Result<Vec<BlockMatch>>
where
    R: AsyncRead + Unpin,
{
    if record.block_size == 0 || record.blocks.is_empty() {
        return Ok(Vec::new());
    }
    let block_size = record.block_size;

    let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
    let mut tail: Option<(usize, u64, u64)> = None;
    for (index, digest) in record.blocks.iter().enumerate() {
        let len = record.block_len(index);
        if len == block_size {
            by_weak.entry(digest.weak).or_default().push(index);
        } else if len > 0 {
            tail = Some((index, index as u64 * block_size, len));
        }
    }

    let mut found: HashMap<usize, u64> = HashMap::new();
    let mut rolling = RollingChecksum::new(block_size as usize);
    let mut tail_bytes = Vec::new();
    let mut position: u64 = 0;
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            if let Some((_, start, len)) = tail {
                if position >= start && position < start + len {
                    tail_bytes.push(byte);
                }
            }
            rolling.push(byte);
            position += 1;

            if !rolling.is_full() {
                continue;
            }
            let Some(candidates) = by_weak.get(&rolling.value()) else {
                continue;
            };
            let open: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|i| !found.contains_key(i))
                .collect();
            if open.is_empty() {
                continue;
            }

            let strong = rolling.window_hash();
            let mut matched = false;
            for index in open {
                if record.blocks[index].strong == strong {
                    found.insert(index, position - block_size);
                    matched = true;
                }
            }
            if matched {
                // Skip past the matched block
                rolling.reset();
            }
        }
    }

    if let Some((index, start, len)) = tail {
        if tail_bytes.len() as u64 == len && strong_hash(&tail_bytes) == record.blocks[index].strong
        {
            found.insert(index, start);
        }
    }

    let mut matches: Vec<BlockMatch> = found
        .into_iter()
        .map(|(block, source_offset)| BlockMatch {
            block,
            source_offset,
        })
        .collect();
    matches.sort_by_key(|m| m.block);
    Ok(matches)
}

/// Copy matched blocks from `source` into `target` at their block offsets.
/// Returns the number of bytes copied.
pub async fn apply_matches(
    source: &Path,
    target: &Path,
    record: &PartsRecord,
    matches: &[BlockMatch],
) -> io::Result<u64> {
    let mut input = File::open(source).await?;
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)
        .await?;
    let mut buf = vec![0u8; record.block_size as usize];
    let mut copied = 0;

    for m in matches {
        let len = record.block_len(m.block) as usize;
        input.seek(SeekFrom::Start(m.source_offset)).await?;
        input.read_exact(&mut buf[..len]).await?;
        output
            .seek(SeekFrom::Start(m.block as u64 * record.block_size))
            .await?;
        output.write_all(&buf[..len]).await?;
        copied += len as u64;
    }
    output.flush().await?;
    Ok(copied)
}
