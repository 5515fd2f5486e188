//! LinkBuffer: a chain of fixed-size blocks with separate read and write
//! cursors.
//!
//! ```text
//!   blocks:  [ consumed | readable ] [ readable ] [ readable | unflushed | free ]
//!             ▲          ▲                                   ▲           ▲
//!           start     read cursor                          flush       write
//! ```
//!
//! Writers `append` (or `reserve` + `commit`) into the tail block; bytes stay
//! invisible to readers until `flush`. Readers `peek`, `next` or `skip` from
//! the read cursor. Blocks behind the read cursor go back to the shared
//! [`BlockPool`] once no view can reference them: `skip` reclaims eagerly,
//! `next` defers reclamation to the next mutating call so the returned view
//! stays valid (the borrow checker enforces the window).
//!
//! A LinkBuffer is not synchronized. Connections wrap each direction in a
//! mutex.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;

use crate::block_pool::BlockPool;
use crate::error::{NetpollError, Result};

struct Block {
    data: Box<[u8]>,
    /// Bytes written into `data`.
    len: usize,
}

impl Block {
    #[inline]
    fn free(&self) -> usize {
        self.data.len() - self.len
    }
}

pub struct LinkBuffer {
    pool: Arc<BlockPool>,
    blocks: VecDeque<Block>,
    /// Index of the block holding the read cursor.
    rblock: usize,
    /// Offset of the read cursor inside `blocks[rblock]`.
    roff: usize,
    /// Flushed, unconsumed bytes.
    readable: usize,
    /// Written but not yet flushed bytes.
    unflushed: usize,
}

impl LinkBuffer {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self {
            pool,
            blocks: VecDeque::new(),
            rblock: 0,
            roff: 0,
            readable: 0,
            unflushed: 0,
        }
    }

    /// Bytes visible to readers.
    #[inline]
    pub fn readable_len(&self) -> usize {
        self.readable
    }

    /// Same as [`readable_len`](Self::readable_len).
    #[inline]
    pub fn len(&self) -> usize {
        self.readable
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable == 0
    }

    /// Bytes written but not yet flushed.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.unflushed
    }

    /// Free space left in the tail block before a new block is needed.
    #[inline]
    pub fn writable_len(&self) -> usize {
        self.blocks.back().map_or(0, Block::free)
    }

    /// Blocks currently linked (consumed-but-unreclaimed included).
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Copy `data` to the write side. Invisible to readers until `flush`.
    pub fn append(&mut self, mut data: &[u8]) {
        self.reclaim();
        while !data.is_empty() {
            let free = self.ensure_tail(1);
            let n = free.min(data.len());
            if let Some(tail) = self.blocks.back_mut() {
                tail.data[tail.len..tail.len + n].copy_from_slice(&data[..n]);
                tail.len += n;
            }
            self.unflushed += n;
            data = &data[n..];
        }
    }

    /// Writable region of at least `min` bytes (clamped to the block size)
    /// at the write cursor. Pair with [`commit`](Self::commit).
    pub fn reserve(&mut self, min: usize) -> &mut [u8] {
        self.reclaim();
        self.ensure_tail(min);
        match self.blocks.back_mut() {
            Some(tail) => &mut tail.data[tail.len..],
            None => &mut [],
        }
    }

    /// Account `n` bytes written into the region returned by `reserve`.
    ///
    /// # Panics
    ///
    /// If `n` exceeds the reserved region.
    pub fn commit(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let tail = self
            .blocks
            .back_mut()
            .filter(|b| b.free() >= n);
        match tail {
            Some(tail) => tail.len += n,
            None => panic!("LinkBuffer::commit({}) beyond reserved region", n),
        }
        self.unflushed += n;
    }

    /// Contiguous `n` writable bytes, already counted as written.
    /// `None` if `n` exceeds the block size.
    pub fn malloc(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.pool.block_size() {
            return None;
        }
        self.reclaim();
        self.ensure_tail(n.max(1));
        self.unflushed += n;
        let tail = self.blocks.back_mut()?;
        let start = tail.len;
        tail.len += n;
        Some(&mut tail.data[start..start + n])
    }

    /// Make every written byte visible to readers.
    #[inline]
    pub fn flush(&mut self) {
        self.readable += self.unflushed;
        self.unflushed = 0;
    }

    /// View of the next `n` readable bytes without consuming them.
    ///
    /// Borrowed when the bytes sit in one block; copied only when they
    /// straddle a block boundary.
    pub fn peek(&self, n: usize) -> Result<Cow<'_, [u8]>> {
        self.check(n)?;
        Ok(self.view(self.rblock, self.roff, n))
    }

    /// Consume `n` bytes, reclaiming blocks left behind.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check(n)?;
        self.advance(n);
        self.reclaim();
        Ok(())
    }

    /// Consume `n` bytes and return a view of them. The view stays valid
    /// until the next mutating call on this buffer.
    pub fn next(&mut self, n: usize) -> Result<Cow<'_, [u8]>> {
        self.reclaim();
        self.check(n)?;
        let (idx, off) = (self.rblock, self.roff);
        self.advance(n);
        Ok(self.view(idx, off, n))
    }

    /// Copy up to `dst.len()` readable bytes into `dst` and consume them.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.readable);
        if n == 0 {
            return 0;
        }
        let (mut idx, mut off) = (self.rblock, self.roff);
        let mut copied = 0;
        while copied < n {
            let b = &self.blocks[idx];
            let take = (b.len - off).min(n - copied);
            dst[copied..copied + take].copy_from_slice(&b.data[off..off + take]);
            copied += take;
            idx += 1;
            off = 0;
        }
        self.advance(n);
        self.reclaim();
        n
    }

    /// Readable bytes as a list of slices, at most `max` entries. Used to
    /// hand the output buffer to a vectored write without copying.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        let mut out = Vec::new();
        let mut left = self.readable;
        let mut off = self.roff;
        for b in self.blocks.iter().skip(self.rblock) {
            if left == 0 || out.len() >= max {
                break;
            }
            let take = (b.len - off).min(left);
            if take > 0 {
                out.push(IoSlice::new(&b.data[off..off + take]));
                left -= take;
            }
            off = 0;
        }
        out
    }

    /// Return consumed blocks to the pool; if nothing is left, return the
    /// remaining blocks too.
    pub fn release(&mut self) {
        self.reclaim();
        if self.readable == 0 && self.unflushed == 0 {
            self.recycle_all();
        }
    }

    /// Discard all content and return every block to the pool.
    pub fn clear(&mut self) {
        self.recycle_all();
        self.readable = 0;
        self.unflushed = 0;
    }

    fn check(&self, n: usize) -> Result<()> {
        if n > self.readable {
            return Err(NetpollError::InsufficientData {
                need: n,
                available: self.readable,
            });
        }
        Ok(())
    }

    /// Ensure the tail block has at least `min` free bytes, linking a new
    /// block if needed. Returns the tail's free space.
    fn ensure_tail(&mut self, min: usize) -> usize {
        let min = min.clamp(1, self.pool.block_size());
        let need_new = self.blocks.back().map_or(true, |b| b.free() < min);
        if need_new {
            let data = self.pool.allocate();
            self.blocks.push_back(Block { data, len: 0 });
        }
        self.writable_len()
    }

    /// Move the read cursor. Caller checked `n <= readable`.
    fn advance(&mut self, n: usize) {
        let mut left = n;
        while left > 0 {
            let avail = self.blocks[self.rblock].len - self.roff;
            if avail >= left {
                self.roff += left;
                left = 0;
            } else {
                left -= avail;
                self.rblock += 1;
                self.roff = 0;
            }
        }
        self.readable -= n;
    }

    fn view(&self, mut idx: usize, mut off: usize, n: usize) -> Cow<'_, [u8]> {
        if n == 0 {
            return Cow::Borrowed(&[]);
        }
        while self.blocks[idx].len == off {
            idx += 1;
            off = 0;
        }
        let first = &self.blocks[idx];
        if first.len - off >= n {
            return Cow::Borrowed(&first.data[off..off + n]);
        }
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let b = &self.blocks[idx];
            let take = (b.len - off).min(n - out.len());
            out.extend_from_slice(&b.data[off..off + take]);
            idx += 1;
            off = 0;
        }
        Cow::Owned(out)
    }

    /// Unlink blocks fully behind the read cursor.
    fn reclaim(&mut self) {
        for _ in 0..self.rblock {
            if let Some(b) = self.blocks.pop_front() {
                self.pool.recycle(b.data);
            }
        }
        self.rblock = 0;

        loop {
            let (exhausted, is_tail, full) = match self.blocks.front() {
                Some(front) => (
                    self.roff >= front.len,
                    self.blocks.len() == 1,
                    front.free() == 0,
                ),
                None => {
                    self.roff = 0;
                    return;
                }
            };
            if !exhausted {
                return;
            }
            if !is_tail || full {
                if let Some(b) = self.blocks.pop_front() {
                    self.pool.recycle(b.data);
                }
                self.roff = 0;
                if is_tail {
                    return;
                }
                continue;
            }
            // Everything written to the tail was consumed: rewind it.
            if let Some(front) = self.blocks.front_mut() {
                front.len = 0;
            }
            self.roff = 0;
            return;
        }
    }

    fn recycle_all(&mut self) {
        while let Some(b) = self.blocks.pop_front() {
            self.pool.recycle(b.data);
        }
        self.rblock = 0;
        self.roff = 0;
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.readable,
            self.unflushed,
            self.blocks.len(),
            self.rblock,
            self.roff,
        )
    }
}

impl Drop for LinkBuffer {
    fn drop(&mut self) {
        self.recycle_all();
    }
}

impl std::fmt::Debug for LinkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkBuffer")
            .field("readable", &self.readable)
            .field("unflushed", &self.unflushed)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}
