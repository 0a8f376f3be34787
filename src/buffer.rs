// Copyright 2024 Robin Dahl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable byte buffer with separate read and write cursors.
//!
//! Each connection owns two of these: one staging inbound bytes for the
//! message callback, one staging outbound bytes for the write path. All
//! operations are single-threaded; the owning loop is the only mutator.

const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A contiguous byte buffer addressed by two cursors.
///
/// Readable bytes live in `[read_idx, write_idx)`. Writing appends at
/// `write_idx`; consuming advances `read_idx`. When the tail runs out of
/// room the readable region is either shifted to the front (if the head
/// slack suffices) or the backing storage grows.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Creates a buffer with at least `capacity` bytes of storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0; capacity.max(1)],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_size(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_idx..self.write_idx]
    }

    fn head_size(&self) -> usize {
        self.read_idx
    }

    fn tail_size(&self) -> usize {
        self.data.len() - self.write_idx
    }

    /// Consumes `len` readable bytes.
    ///
    /// Panics if `len` exceeds the readable size.
    pub fn advance_read(&mut self, len: usize) {
        assert!(len <= self.readable_size());
        self.read_idx += len;
    }

    /// Marks `len` bytes of the writable region as written.
    ///
    /// Panics if `len` exceeds the tail slack.
    pub fn advance_write(&mut self, len: usize) {
        assert!(len <= self.tail_size());
        self.write_idx += len;
    }

    /// Makes room for `len` more bytes at the write cursor.
    ///
    /// Prefers the existing tail slack, then compacts the readable region
    /// to the front, and only then grows the backing storage.
    pub fn ensure_writable(&mut self, len: usize) {
        if len <= self.tail_size() {
            return;
        }
        if len <= self.head_size() + self.tail_size() {
            let readable = self.readable_size();
            self.data.copy_within(self.read_idx..self.write_idx, 0);
            self.read_idx = 0;
            self.write_idx = readable;
        } else {
            self.data.resize(self.write_idx + len, 0);
        }
    }

    /// Returns a writable slice of exactly `len` bytes, compacting or
    /// growing as needed. Pair with [`advance_write`](Self::advance_write).
    pub fn writable_mut(&mut self, len: usize) -> &mut [u8] {
        self.ensure_writable(len);
        &mut self.data[self.write_idx..self.write_idx + len]
    }

    /// Appends `data` to the buffer.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_writable(data.len());
        self.data[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Appends the readable region of `other`.
    pub fn write_buffer(&mut self, other: &Buffer) {
        self.write(other.peek());
    }

    /// Removes and returns the first `len` readable bytes.
    ///
    /// Panics if `len` exceeds the readable size.
    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_size());
        let out = self.data[self.read_idx..self.read_idx + len].to_vec();
        self.advance_read(len);
        out
    }

    /// Removes the first `len` readable bytes and returns them as a string,
    /// replacing invalid UTF-8.
    pub fn read_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.read_bytes(len)).into_owned()
    }

    /// Offset of the next `\n` within the readable region, if any.
    pub fn find_newline(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// The readable range up to and including the next `\n`, without
    /// consuming it.
    pub fn get_line(&self) -> Option<&[u8]> {
        self.find_newline().map(|pos| &self.peek()[..=pos])
    }

    /// Removes and returns one line, including its `\n`.
    pub fn take_line(&mut self) -> Option<String> {
        let len = self.find_newline()? + 1;
        Some(self.read_string(len))
    }

    /// Resets both cursors, discarding any readable data.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}
