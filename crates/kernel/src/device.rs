//! The executor seam.
//!
//! A [`ComputeDevice`] owns storage and pipelines and executes submitted
//! batches in submission order on a single queue. Orchestration code never
//! talks to a backend directly; it goes through [`crate::ComputeContext`].

use crate::batch::CommandBatch;
use crate::buffer::{BufferDesc, GpuBuffer};
use crate::error::Result;
use crate::fence::Fence;
use crate::kernels::KernelId;

/// A compute executor: the reference CPU device or a wgpu device.
pub trait ComputeDevice {
    /// Human-readable backend name, for logs.
    fn name(&self) -> String;

    /// Allocate a buffer, optionally uploading `contents` (at most
    /// `desc.size_bytes()` bytes, the rest is zeroed).
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<GpuBuffer>;

    /// Free a buffer once all previously submitted work is done with it.
    fn release_buffer(&mut self, buffer: &GpuBuffer) -> Result<()>;

    /// Build the pipeline for `kernel`. Idempotent.
    fn prepare_kernel(&mut self, kernel: KernelId) -> Result<()>;

    /// Queue-ordered upload into a buffer at `byte_offset`.
    fn write_buffer(&self, buffer: &GpuBuffer, byte_offset: u64, bytes: &[u8]) -> Result<()>;

    /// Submit a batch without blocking. `fence` is signaled to `value` once
    /// every command in the batch has completed.
    fn submit(&self, batch: &CommandBatch, fence: &Fence, value: u64) -> Result<()>;

    /// Block until `fence` reaches `value`. The only blocking call.
    fn wait(&self, fence: &Fence, value: u64) -> Result<()>;

    /// Queue-ordered readback of a whole buffer. Diagnostics and tests only.
    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>>;
}
