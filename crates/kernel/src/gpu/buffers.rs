//! Device buffer allocation, uploads and staging readback.

use crate::buffer::BufferDesc;
use crate::error::{Error, Result};

/// Usages every pipeline buffer carries: any buffer may be bound as storage,
/// consumed as an indirect argument, uploaded to or read back.
pub const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::INDIRECT)
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Round a byte size up to the copy alignment.
pub fn aligned_size(bytes: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    bytes.div_ceil(align).max(1) * align
}

/// Allocate a storage buffer, uploading `contents` into the front of it
/// through a mapped-at-creation range. The remainder is zero.
pub fn create_storage(device: &wgpu::Device, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<wgpu::Buffer> {
    let size = aligned_size(desc.size_bytes());
    if contents.is_some_and(|c| c.len() as u64 > size) {
        return Err(Error::ResourceCreation {
            label: desc.label.clone(),
            reason: format!("initial contents exceed capacity {size}"),
        });
    }
    let max = device.limits().max_storage_buffer_binding_size as u64;
    if size > max {
        return Err(Error::ResourceCreation {
            label: desc.label.clone(),
            reason: format!("{size} bytes exceeds the storage binding limit {max}"),
        });
    }
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(&desc.label),
        size,
        usage: STORAGE_USAGE,
        mapped_at_creation: contents.is_some(),
    });
    if let Some(bytes) = contents {
        buffer.slice(..).get_mapped_range_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.unmap();
    }
    Ok(buffer)
}

/// Copy `buffer` into a staging buffer and map it for reading. Blocks on
/// the device until the copy has landed.
pub fn read_back(device: &wgpu::Device, queue: &wgpu::Queue, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
    let size = buffer.size();
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback_staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| Error::BufferMap("map callback dropped".into()))?
        .map_err(|e| Error::BufferMap(e.to_string()))?;

    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

/// Pack the constant blocks of a batch into one uniform buffer, each block
/// at an offset aligned to `align`. Returns the buffer and the offsets in
/// pass order.
pub fn pack_constants<'a>(
    device: &wgpu::Device,
    blocks: impl Iterator<Item = &'a [u8]>,
    align: u64,
) -> (Option<wgpu::Buffer>, Vec<u64>) {
    let mut bytes: Vec<u8> = Vec::new();
    let mut offsets = Vec::new();
    for block in blocks {
        let offset = (bytes.len() as u64).div_ceil(align) * align;
        bytes.resize(offset as usize, 0);
        bytes.extend_from_slice(block);
        offsets.push(offset);
    }
    if bytes.is_empty() {
        return (None, offsets);
    }
    bytes.resize(aligned_size(bytes.len() as u64) as usize, 0);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("batch_constants"),
        size: bytes.len() as u64,
        usage: wgpu::BufferUsages::UNIFORM,
        mapped_at_creation: true,
    });
    buffer.slice(..).get_mapped_range_mut().copy_from_slice(&bytes);
    buffer.unmap();
    (Some(buffer), offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_to_copy_alignment() {
        assert_eq!(aligned_size(0), 4);
        assert_eq!(aligned_size(12), 12);
        assert_eq!(aligned_size(13), 16);
    }
}
