//! Write buffer: the staging area between the tree and the segment files.
//!
//! Commits stage node records and value payloads here, then render the
//! staged bytes into chunks that never cross a segment boundary. A record
//! that would not fit in the current segment rolls the buffer over to the
//! next segment before the record's position is assigned.

use bytes::Bytes;

use crate::constants::WRITE_BUFFER_INITIAL;
use crate::file::SegmentId;

/// One rendered run of bytes destined for a single segment.
#[derive(Debug)]
pub struct WriteChunk {
    pub index: SegmentId,
    /// On-disk offset at which `data` begins.
    pub pos: u32,
    pub data: Bytes,
}

#[derive(Debug)]
struct Sealed {
    index: SegmentId,
    pos: u32,
    start: usize,
    end: usize,
}

/// Growable byte staging area that splits its output at segment boundaries.
#[derive(Debug)]
pub struct WriteBuffer {
    /// Segment receiving the chunk currently being staged.
    index: SegmentId,
    /// On-disk offset where the current chunk begins.
    offset: u32,
    /// Buffer position where the current chunk begins.
    chunk_start: usize,
    /// Buffer write cursor.
    written: usize,
    data: Vec<u8>,
    /// Chunks sealed by segment rollover, in write order.
    sealed: Vec<Sealed>,
    max_file_size: u32,
}

impl WriteBuffer {
    pub fn new(max_file_size: u32) -> Self {
        Self {
            index: SegmentId::NONE,
            offset: 0,
            chunk_start: 0,
            written: 0,
            data: Vec::new(),
            sealed: Vec::new(),
            max_file_size,
        }
    }

    /// Resets the buffer to stage bytes for `index` starting at `offset`.
    pub fn start(&mut self, index: SegmentId, offset: u32) {
        self.index = index;
        self.offset = offset;
        self.chunk_start = 0;
        self.written = 0;
        self.sealed.clear();
    }

    /// Segment the next write lands in.
    pub fn index(&self) -> SegmentId {
        self.index
    }

    /// Logical segment offset of the next write.
    pub fn position(&self) -> u32 {
        self.offset + (self.written - self.chunk_start) as u32
    }

    /// Total staged bytes since the last flush.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Ensures capacity for `size` more bytes, rolling over to the next
    /// segment when the write would cross the segment size limit.
    ///
    /// Callers must take [`position`](Self::position) after this call: a
    /// rollover moves the write to `(index + 1, 0)`.
    pub fn expand(&mut self, size: usize) {
        self.grow(size);
        if self.position() as u64 + size as u64 > self.max_file_size as u64 {
            if self.written > self.chunk_start {
                self.sealed.push(Sealed {
                    index: self.index,
                    pos: self.offset,
                    start: self.chunk_start,
                    end: self.written,
                });
            }
            self.index = self.index.next();
            self.offset = 0;
            self.chunk_start = self.written;
        }
    }

    /// Appends raw bytes, returning the segment offset at which they start.
    pub fn write(&mut self, bytes: &[u8]) -> u32 {
        self.expand(bytes.len());
        let pos = self.position();
        self.data[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
        pos
    }

    /// Appends `size` zero bytes.
    pub fn pad(&mut self, size: usize) {
        self.expand(size);
        self.data[self.written..self.written + size].fill(0);
        self.written += size;
    }

    /// Renders the staged bytes as per-segment chunks and resets the buffer
    /// so the next commit continues where this one ended.
    pub fn flush(&mut self) -> Vec<WriteChunk> {
        let mut chunks = Vec::with_capacity(self.sealed.len() + 1);
        for sealed in self.sealed.drain(..) {
            chunks.push(WriteChunk {
                index: sealed.index,
                pos: sealed.pos,
                data: Bytes::copy_from_slice(&self.data[sealed.start..sealed.end]),
            });
        }
        if self.written > self.chunk_start {
            chunks.push(WriteChunk {
                index: self.index,
                pos: self.offset,
                data: Bytes::copy_from_slice(&self.data[self.chunk_start..self.written]),
            });
        }
        self.offset = self.position();
        self.chunk_start = 0;
        self.written = 0;
        chunks
    }

    /// Doubles the backing capacity until `size` more bytes fit.
    fn grow(&mut self, size: usize) {
        let needed = self.written + size;
        if self.data.len() >= needed {
            return;
        }
        let mut capacity = self.data.len().max(WRITE_BUFFER_INITIAL);
        while capacity < needed {
            capacity *= 2;
        }
        self.data.resize(capacity, 0);
    }
}
