//! Device-resident typed arrays and the views used to bind them.
//!
//! A [`GpuBuffer`] is a handle: the storage itself lives on the device that
//! created it. Capacity is fixed at creation. Binding a view never changes
//! the buffer's access state; that is what [`crate::hazard`] is for.

use std::sync::Arc;

/// Opaque buffer identifier, unique per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Creation parameters for a buffer.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Debug label, surfaced in logs and backend diagnostics.
    pub label: String,
    /// Number of elements.
    pub count: u64,
    /// Size of one element in bytes. Must be a multiple of 4.
    pub stride: u64,
}

impl BufferDesc {
    /// Describe an array of `count` elements of type `T`.
    pub fn of<T>(label: impl Into<String>, count: u64) -> Self {
        Self {
            label: label.into(),
            count,
            stride: std::mem::size_of::<T>() as u64,
        }
    }

    /// Total size in bytes. Empty requests are rounded up to one element
    /// because devices reject zero-sized allocations.
    pub fn size_bytes(&self) -> u64 {
        self.count.max(1) * self.stride
    }
}

/// How a kernel may touch a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Shader resource view: loads only.
    Read,
    /// Unordered access view: loads, stores and atomics.
    ReadWrite,
}

/// Handle to a device buffer.
#[derive(Debug, Clone)]
pub struct GpuBuffer {
    id: BufferId,
    count: u64,
    stride: u64,
    label: Arc<str>,
}

impl GpuBuffer {
    pub(crate) fn new(id: BufferId, desc: &BufferDesc) -> Self {
        Self {
            id,
            count: desc.count.max(1),
            stride: desc.stride,
            label: Arc::from(desc.label.as_str()),
        }
    }

    /// Device-unique identifier.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Element capacity.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Element size in bytes.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Capacity in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.count * self.stride
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whole-buffer read-only view.
    pub fn read_view(&self) -> BufferView {
        BufferView {
            buffer: self.id,
            offset: 0,
            size: self.size_bytes(),
            access: Access::Read,
        }
    }

    /// Whole-buffer read-write view.
    pub fn write_view(&self) -> BufferView {
        BufferView {
            buffer: self.id,
            offset: 0,
            size: self.size_bytes(),
            access: Access::ReadWrite,
        }
    }

    /// Address of the first byte, for indirect arguments and atomic targets.
    pub fn raw_address(&self) -> RawAddress {
        RawAddress {
            buffer: self.id,
            offset: 0,
            size: self.size_bytes(),
        }
    }
}

/// A bindable window into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    /// Underlying buffer.
    pub buffer: BufferId,
    /// Byte offset of the window.
    pub offset: u64,
    /// Byte length of the window.
    pub size: u64,
    /// Declared access.
    pub access: Access,
}

/// A byte address inside a buffer.
///
/// Used as the source of indirect launch shapes, and as a root view when a
/// kernel treats a few words of a buffer as atomic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddress {
    /// Underlying buffer.
    pub buffer: BufferId,
    /// Byte offset from the start of the buffer.
    pub offset: u64,
    size: u64,
}

impl RawAddress {
    /// Address `bytes` further into the same buffer.
    pub fn offset(self, bytes: u64) -> Self {
        Self {
            buffer: self.buffer,
            offset: self.offset + bytes,
            size: self.size.saturating_sub(bytes),
        }
    }

    /// Bytes remaining from this address to the end of the buffer.
    pub fn remaining(&self) -> u64 {
        self.size
    }

    /// Read-write view starting at this address (atomic counters).
    pub fn as_atomic(self) -> BufferView {
        BufferView {
            buffer: self.buffer,
            offset: self.offset,
            size: self.size,
            access: Access::ReadWrite,
        }
    }

    /// Read-only view starting at this address.
    pub fn as_read(self) -> BufferView {
        BufferView {
            buffer: self.buffer,
            offset: self.offset,
            size: self.size,
            access: Access::Read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_address_offsets_accumulate() {
        let buf = GpuBuffer::new(BufferId(3), &BufferDesc::of::<[u32; 3]>("dispatch", 2));
        assert_eq!(buf.size_bytes(), 24);
        let second = buf.raw_address().offset(12);
        assert_eq!(second.offset, 12);
        assert_eq!(second.remaining(), 12);
        let view = second.as_atomic();
        assert_eq!(view.access, Access::ReadWrite);
        assert_eq!(view.offset, 12);
    }

    #[test]
    fn empty_buffers_round_up_to_one_element() {
        let desc = BufferDesc::of::<u32>("empty", 0);
        assert_eq!(desc.size_bytes(), 4);
        assert_eq!(GpuBuffer::new(BufferId(0), &desc).count(), 1);
    }
}
