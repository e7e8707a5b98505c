use super::{ByteBuffer, ByteOrder};
use crate::error::{KeelsonError, Result};
use std::collections::VecDeque;

/// A logical buffer made of several `ByteBuffer` components.
///
/// Reads consume from the front component and drop it once it is exhausted.
/// Accessors spanning a component boundary copy the bytes together; a read
/// that fits inside the front component is zero-copy.
///
/// Every component must use the composite's byte order.
#[derive(Debug, Default)]
pub struct CompositeBuffer {
    components: VecDeque<ByteBuffer>,
    len: usize,
    order: ByteOrder,
}

macro_rules! composite_ints {
    ($($ty:ty => $get:ident, $read:ident;)*) => {
        $(
            pub fn $get(&self, index: usize) -> Result<$ty> {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                self.get_bytes(index, &mut raw)?;
                Ok(match self.order {
                    ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                    ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                })
            }

            pub fn $read(&mut self) -> Result<$ty> {
                let value = self.$get(0)?;
                self.skip(std::mem::size_of::<$ty>())?;
                Ok(value)
            }
        )*
    };
}

impl CompositeBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            components: VecDeque::new(),
            len: 0,
            order,
        }
    }

    #[inline]
    #[must_use]
    pub const fn order(&self) -> ByteOrder {
        self.order
    }

    /// Total readable bytes across all components.
    #[inline]
    #[must_use]
    pub const fn readable_bytes(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Append a component. Empty buffers are dropped.
    pub fn add_component(&mut self, buf: ByteBuffer) -> Result<()> {
        if buf.order() != self.order {
            return Err(KeelsonError::ByteOrderMismatch);
        }
        if !buf.is_readable() {
            return Ok(());
        }
        self.len += buf.readable_bytes();
        self.components.push_back(buf);
        Ok(())
    }

    /// Remove the component at `index`, returning its unread bytes.
    pub fn remove_component(&mut self, index: usize) -> Option<ByteBuffer> {
        let comp = self.components.remove(index)?;
        self.len -= comp.readable_bytes();
        Some(comp)
    }

    /// Copy `dst.len()` bytes starting at a logical index (relative to the
    /// first readable byte).
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        let n = dst.len();
        match index.checked_add(n) {
            Some(end) if end <= self.len => {}
            _ => return Err(KeelsonError::out_of_bounds(index, n, self.len)),
        }

        let mut skip = index;
        let mut out_off = 0;
        for comp in &self.components {
            if out_off == n {
                break;
            }
            let data = comp.readable_slice();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let take = (n - out_off).min(data.len() - skip);
            dst[out_off..out_off + take].copy_from_slice(&data[skip..skip + take]);
            out_off += take;
            skip = 0;
        }
        Ok(())
    }

    composite_ints! {
        u8 => get_u8, read_u8;
        u16 => get_u16, read_u16;
        u32 => get_u32, read_u32;
        u64 => get_u64, read_u64;
    }

    /// Consume `n` bytes, dropping fully-read components.
    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        if n > self.len {
            return Err(KeelsonError::out_of_bounds(0, n, self.len));
        }
        self.len -= n;
        while n > 0 {
            let Some(front) = self.components.front_mut() else {
                break;
            };
            let avail = front.readable_bytes();
            if n >= avail {
                n -= avail;
                self.components.pop_front();
                continue;
            }
            front.skip(n)?;
            break;
        }
        Ok(())
    }

    /// Take exactly `n` bytes from the front.
    ///
    /// Zero-copy when the front component holds all `n` bytes.
    pub fn read_slice(&mut self, n: usize) -> Result<ByteBuffer> {
        if n > self.len {
            return Err(KeelsonError::out_of_bounds(0, n, self.len));
        }
        if n == 0 {
            return Ok(ByteBuffer::new().with_order(self.order));
        }
        if let Some(front) = self.components.front_mut() {
            if front.readable_bytes() >= n {
                let out = front.read_slice(n)?;
                self.len -= n;
                if !front.is_readable() {
                    self.components.pop_front();
                }
                return Ok(out);
            }
        }

        // Spans components: copy.
        let mut out = ByteBuffer::with_capacity(n).with_order(self.order);
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.components.front_mut() else {
                break;
            };
            let take = remaining.min(front.readable_bytes());
            out.write_slice(&front.readable_slice()[..take])?;
            front.skip(take)?;
            remaining -= take;
            if !front.is_readable() {
                self.components.pop_front();
            }
        }
        self.len -= n;
        Ok(out)
    }

    /// Drop every component whose bytes have all been read. Returns how many
    /// components were released.
    pub fn discard_read_components(&mut self) -> usize {
        let before = self.components.len();
        self.components.retain(ByteBuffer::is_readable);
        before - self.components.len()
    }

    /// Merge every component into one contiguous buffer.
    pub fn consolidate(&mut self) -> Result<ByteBuffer> {
        if self.components.len() == 1 {
            self.len = 0;
            return self
                .components
                .pop_front()
                .ok_or(KeelsonError::out_of_bounds(0, 0, 0));
        }
        let total = self.len;
        self.read_slice(total)
    }

    /// Iterate over the components in order.
    pub fn components(&self) -> impl Iterator<Item = &ByteBuffer> {
        self.components.iter()
    }
}
