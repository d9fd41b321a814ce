//! Explicit compute context passed to every pipeline step.
//!
//! A context bundles one device with the hazard tracker, the completion fence
//! and the recycled command batch. Nothing here is global, so independent
//! contexts (and simulations) coexist in one process.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::batch::{CommandBatch, Pass};
use crate::buffer::{BufferDesc, BufferId, GpuBuffer};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::hazard::{ResourceState, ResourceTracker};
use crate::kernels::{ClearConstants, KernelId, CLEAR_THREADS};

/// When recorded work is handed to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitPolicy {
    /// One batch per frame; the host only waits to bound frames in flight.
    #[default]
    PerFrame,
    /// Submit, wait and recycle the batch after every pipeline stage.
    PerStage,
}

/// Counters of recorded and submitted work, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Compute dispatches recorded (direct and indirect).
    pub dispatches: u64,
    /// Dispatches and draws whose shape came from a device buffer.
    pub indirect_dispatches: u64,
    /// Render passes recorded.
    pub draws: u64,
    /// Individual barriers recorded.
    pub barriers: u64,
    /// Batches submitted.
    pub submissions: u64,
}

/// Compute context over a [`ComputeDevice`].
pub struct ComputeContext<D: ComputeDevice> {
    device: D,
    tracker: ResourceTracker,
    /// Tracker as of the last accepted submission. A rejected batch rolls
    /// the tracker back to it.
    settled: ResourceTracker,
    fence: Fence,
    last_submitted: u64,
    batch: CommandBatch,
    stats: ContextStats,
    policy: SubmitPolicy,
    max_frames_in_flight: usize,
    in_flight: VecDeque<u64>,
}

impl<D: ComputeDevice> ComputeContext<D> {
    /// Wrap a device.
    pub fn new(device: D) -> Self {
        tracing::info!("compute context on {}", device.name());
        Self {
            device,
            tracker: ResourceTracker::new(),
            settled: ResourceTracker::new(),
            fence: Fence::new(),
            last_submitted: 0,
            batch: CommandBatch::new(),
            stats: ContextStats::default(),
            policy: SubmitPolicy::default(),
            max_frames_in_flight: 2,
            in_flight: VecDeque::new(),
        }
    }

    /// Set the submission policy and the frame-in-flight bound (at least 1).
    pub fn with_policy(mut self, policy: SubmitPolicy, max_frames_in_flight: usize) -> Self {
        self.policy = policy;
        self.max_frames_in_flight = max_frames_in_flight.max(1);
        self
    }

    /// Active submission policy.
    pub fn policy(&self) -> SubmitPolicy {
        self.policy
    }

    /// Underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Counters since creation.
    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    /// Recorded state of a buffer.
    pub fn buffer_state(&self, buffer: BufferId) -> Option<ResourceState> {
        self.tracker.state(buffer)
    }

    /// The context's completion fence.
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Fence value of the most recent submission.
    pub fn last_submitted(&self) -> u64 {
        self.last_submitted
    }

    // ---- resources ----

    /// Allocate a buffer. Failure is fatal for the caller's setup.
    pub fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<GpuBuffer> {
        let buffer = self.device.create_buffer(desc, contents)?;
        self.tracker.register(buffer.id());
        self.settled.register(buffer.id());
        tracing::debug!(
            "buffer {:?} `{}`: {} x {} bytes",
            buffer.id(),
            buffer.label(),
            buffer.count(),
            buffer.stride()
        );
        Ok(buffer)
    }

    /// Allocate a buffer holding `data`.
    pub fn create_buffer_init<T: bytemuck::Pod>(&mut self, label: &str, data: &[T]) -> Result<GpuBuffer> {
        let desc = BufferDesc::of::<T>(label, data.len() as u64);
        self.create_buffer(&desc, Some(bytemuck::cast_slice(data)))
    }

    /// Allocate a zero-filled buffer of `count` elements of `T`.
    pub fn create_buffer_zeroed<T: bytemuck::Pod>(&mut self, label: &str, count: u64) -> Result<GpuBuffer> {
        self.create_buffer(&BufferDesc::of::<T>(label, count), None)
    }

    /// Release a buffer. Work already submitted may still use it.
    pub fn release_buffer(&mut self, buffer: GpuBuffer) -> Result<()> {
        self.tracker.forget(buffer.id());
        self.settled.forget(buffer.id());
        self.device.release_buffer(&buffer)
    }

    /// Build pipelines ahead of the first dispatch.
    pub fn prepare_kernels(&mut self, kernels: &[KernelId]) -> Result<()> {
        for &kernel in kernels {
            self.device.prepare_kernel(kernel)?;
        }
        Ok(())
    }

    // ---- recording ----

    /// Record a pass: validate it against the kernel table, emit the batched
    /// barriers it needs, then the dispatch. An indirect argument buffer is
    /// returned to read-write straight after the dispatch.
    pub fn dispatch(&mut self, pass: Pass) -> Result<()> {
        let desc = pass.kernel.desc();
        desc.check(&pass)?;

        let requirements = pass.requirements();
        let barriers = self.tracker.prepare(&requirements)?;
        for barrier in &barriers {
            tracing::trace!("{}: {:?}", desc.label, barrier);
        }
        self.stats.barriers += barriers.len() as u64;
        self.batch.barrier(barriers);

        let argument = pass.shape.argument();
        match pass.shape {
            crate::batch::DispatchShape::DrawIndirect(_) => self.stats.draws += 1,
            _ => self.stats.dispatches += 1,
        }
        if argument.is_some() {
            self.stats.indirect_dispatches += 1;
        }
        self.batch.dispatch(pass);
        self.tracker.commit(&requirements);

        if let Some(args) = argument {
            if let Some(restore) = self.tracker.release_indirect(args.buffer) {
                self.stats.barriers += 1;
                self.batch.barrier(vec![restore]);
            }
        }
        Ok(())
    }

    /// Record a [`KernelId::BufferClear`] filling every word of `buffer`
    /// with `value`.
    pub fn clear_buffer(&mut self, buffer: &GpuBuffer, value: u32) -> Result<()> {
        let words = u32::try_from(buffer.size_bytes() / 4).map_err(|_| {
            Error::Validation(format!(
                "`{}` holds {} bytes, past the 32-bit word index of a clear",
                buffer.label(),
                buffer.size_bytes()
            ))
        })?;
        self.dispatch(
            Pass::new(KernelId::BufferClear)
                .bind(buffer.write_view())
                .constants(&ClearConstants {
                    count: words,
                    value,
                    ..Default::default()
                })
                .groups(words.div_ceil(CLEAR_THREADS)),
        )
    }

    /// Commands recorded since the last submission.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    // ---- submission ----

    /// Submit the recorded batch and recycle it. Returns the fence value that
    /// marks its completion. With nothing recorded, returns the previous
    /// value without submitting.
    ///
    /// A batch the device refuses is dropped and the recorded buffer states
    /// roll back to the last accepted submission, so the next frame records
    /// from a consistent state.
    pub fn submit(&mut self) -> Result<u64> {
        if self.batch.is_empty() {
            return Ok(self.last_submitted);
        }
        let value = self.last_submitted + 1;
        if let Err(err) = self.device.submit(&self.batch, &self.fence, value) {
            tracing::warn!("device refused a batch of {} commands: {err}", self.batch.len());
            self.batch.reset();
            self.tracker = self.settled.clone();
            return Err(err);
        }
        tracing::debug!("submitted {} commands, fence -> {}", self.batch.len(), value);
        self.last_submitted = value;
        self.stats.submissions += 1;
        self.batch.reset();
        self.settled = self.tracker.clone();
        Ok(value)
    }

    /// Block until the fence reaches `value`.
    pub fn wait(&self, value: u64) -> Result<()> {
        self.device.wait(&self.fence, value)
    }

    /// Submit and block until the batch completes.
    pub fn submit_and_wait(&mut self) -> Result<u64> {
        let value = self.submit()?;
        self.wait(value)?;
        Ok(value)
    }

    /// Close a pipeline stage. Under [`SubmitPolicy::PerStage`] the batch is
    /// submitted and waited on so the next stage starts from a recycled,
    /// empty batch; otherwise recording simply continues.
    pub fn end_stage(&mut self) -> Result<()> {
        match self.policy {
            SubmitPolicy::PerStage => self.submit_and_wait().map(|_| ()),
            SubmitPolicy::PerFrame => Ok(()),
        }
    }

    /// Close a frame: submit what is recorded, then block only while more
    /// than `max_frames_in_flight` frames are outstanding.
    pub fn end_frame(&mut self) -> Result<()> {
        let value = self.submit()?;
        if self.in_flight.back() != Some(&value) {
            self.in_flight.push_back(value);
        }
        while self.in_flight.len() > self.max_frames_in_flight {
            if let Some(oldest) = self.in_flight.pop_front() {
                self.wait(oldest)?;
            }
        }
        Ok(())
    }

    /// Block until every submitted batch has completed.
    pub fn flush(&mut self) -> Result<()> {
        self.submit_and_wait()?;
        self.in_flight.clear();
        Ok(())
    }

    // ---- host data ----

    /// Upload `data` at element `offset`. Lands before the next submitted
    /// batch executes.
    pub fn write_buffer<T: bytemuck::Pod>(&self, buffer: &GpuBuffer, offset: u64, data: &[T]) -> Result<()> {
        let byte_offset = offset * std::mem::size_of::<T>() as u64;
        self.device
            .write_buffer(buffer, byte_offset, bytemuck::cast_slice(data))
    }

    /// Read a whole buffer back. Submits recorded work first so the data
    /// reflects everything recorded so far.
    pub fn read_buffer<T: bytemuck::Pod>(&mut self, buffer: &GpuBuffer) -> Result<Vec<T>> {
        self.submit()?;
        let bytes = self.device.read_buffer(buffer)?;
        let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>().max(1);
        Ok(bytemuck::pod_collect_to_vec(&bytes[..whole]))
    }
}
