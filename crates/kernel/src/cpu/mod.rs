//! Reference CPU executor.
//!
//! `CpuDevice` behaves like a GPU queue: a worker thread executes submitted
//! batches, uploads and readbacks strictly in submission order, and the host
//! only synchronizes through fences. Storage is word-addressed
//! (`AtomicU32`), and every work group of a launch runs in parallel on the
//! rayon pool, so concurrent atomic appends, slot claims and counter bumps
//! really do race the way they would on a device. Indirect launch shapes are
//! read from the argument buffer on the worker, at dispatch time.
//!
//! With validation enabled the worker mirrors every buffer's state from the
//! recorded barriers and rejects any dispatch that binds a buffer in the
//! wrong state or reuses a written buffer without a drain, the way a
//! graphics debug layer would.

mod bukkit;
mod surface;

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use rayon::prelude::*;

use crate::batch::{Command, CommandBatch, DispatchArgs, DispatchShape, DrawArgs, Pass};
use crate::buffer::{Access, BufferDesc, BufferId, GpuBuffer, RawAddress};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::hazard::{Barrier, ResourceState};
use crate::kernels::{ClearConstants, KernelId, MAX_GROUPS_PER_AXIS};

type Storage = Arc<[AtomicU32]>;
type Registry = Arc<RwLock<HashMap<BufferId, Storage>>>;

/// Options for [`CpuDevice`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDeviceOptions {
    /// Check recorded barriers against every dispatch on execution.
    pub validation: bool,
}

/// Vertex-stage output of one indirect draw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawOutput {
    /// The argument record the draw consumed.
    pub args: DrawArgs,
    /// Clip-space position of each vertex, in draw order.
    pub clip_positions: Vec<[f32; 4]>,
}

enum Job {
    Batch {
        batch: CommandBatch,
        fence: Fence,
        value: u64,
    },
    Write {
        buffer: BufferId,
        word_offset: usize,
        words: Vec<u32>,
    },
    Read {
        buffer: BufferId,
        reply: Sender<Result<Vec<u8>>>,
    },
    Release(BufferId),
}

#[derive(Default)]
struct Shared {
    failure: Mutex<Option<Error>>,
    draws: Mutex<Vec<DrawOutput>>,
}

/// CPU implementation of [`ComputeDevice`].
pub struct CpuDevice {
    registry: Registry,
    shared: Arc<Shared>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    next_id: u32,
    released: HashSet<BufferId>,
    prepared: HashSet<KernelId>,
    validation: bool,
}

impl CpuDevice {
    /// Start a device and its queue thread.
    pub fn new(options: CpuDeviceOptions) -> Result<Self> {
        let registry: Registry = Arc::default();
        let shared: Arc<Shared> = Arc::default();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let registry = Arc::clone(&registry);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("cpu-compute-queue".into())
                .spawn(move || run_queue(rx, registry, shared, options.validation))
                .map_err(|e| Error::DeviceRequest(e.to_string()))?
        };
        Ok(Self {
            registry,
            shared,
            jobs: Some(tx),
            worker: Some(worker),
            next_id: 0,
            released: HashSet::new(),
            prepared: HashSet::new(),
            validation: options.validation,
        })
    }

    /// Device with the validation layer on.
    pub fn with_validation() -> Result<Self> {
        Self::new(CpuDeviceOptions { validation: true })
    }

    /// Drain the outputs of draws executed so far.
    pub fn take_draws(&self) -> Vec<DrawOutput> {
        std::mem::take(&mut *self.shared.draws.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn send(&self, job: Job) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| Error::DeviceLost("queue closed".into()))?
            .send(job)
            .map_err(|_| Error::DeviceLost("queue thread exited".into()))
    }

    fn ensure_live(&self, buffer: &GpuBuffer) -> Result<()> {
        self.ensure_id_live(buffer.id())
    }

    fn ensure_id_live(&self, id: BufferId) -> Result<()> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(&id) && !self.released.contains(&id) {
            Ok(())
        } else {
            Err(Error::UnknownBuffer(id))
        }
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> String {
        format!(
            "cpu ({} threads{})",
            rayon::current_num_threads(),
            if self.validation { ", validation" } else { "" }
        )
    }

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<GpuBuffer> {
        if desc.stride == 0 || desc.stride % 4 != 0 {
            return Err(Error::ResourceCreation {
                label: desc.label.clone(),
                reason: format!("stride {} is not a positive multiple of 4", desc.stride),
            });
        }
        let size = desc.size_bytes();
        if contents.is_some_and(|c| c.len() as u64 > size) {
            return Err(Error::ResourceCreation {
                label: desc.label.clone(),
                reason: format!("initial contents exceed capacity {size}"),
            });
        }
        let words = (size / 4) as usize;
        let mut init = vec![0u32; words];
        if let Some(bytes) = contents {
            for (dst, chunk) in init.iter_mut().zip(bytes.chunks(4)) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                *dst = u32::from_ne_bytes(word);
            }
        }
        let storage: Storage = init.into_iter().map(AtomicU32::new).collect();

        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, storage);
        Ok(GpuBuffer::new(id, desc))
    }

    fn release_buffer(&mut self, buffer: &GpuBuffer) -> Result<()> {
        self.ensure_live(buffer)?;
        self.released.insert(buffer.id());
        self.send(Job::Release(buffer.id()))
    }

    fn prepare_kernel(&mut self, kernel: KernelId) -> Result<()> {
        if self.prepared.insert(kernel) {
            tracing::debug!("cpu kernel `{}` ready", kernel.desc().label);
        }
        Ok(())
    }

    fn write_buffer(&self, buffer: &GpuBuffer, byte_offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_live(buffer)?;
        if byte_offset % 4 != 0 || bytes.len() % 4 != 0 {
            return Err(Error::Validation(format!(
                "write to `{}` is not word aligned",
                buffer.label()
            )));
        }
        if byte_offset + bytes.len() as u64 > buffer.size_bytes() {
            return Err(Error::Validation(format!(
                "write of {} bytes at {byte_offset} overruns `{}`",
                bytes.len(),
                buffer.label()
            )));
        }
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.send(Job::Write {
            buffer: buffer.id(),
            word_offset: (byte_offset / 4) as usize,
            words,
        })
    }

    fn submit(&self, batch: &CommandBatch, fence: &Fence, value: u64) -> Result<()> {
        // Like queue submission validation: a batch naming a released buffer
        // is refused whole and nothing in it runs.
        for command in batch.commands() {
            if let Command::Dispatch(pass) = command {
                for view in &pass.bindings {
                    self.ensure_id_live(view.buffer)?;
                }
                if let Some(args) = pass.shape.argument() {
                    self.ensure_id_live(args.buffer)?;
                }
            }
        }
        self.send(Job::Batch {
            batch: batch.clone(),
            fence: fence.clone(),
            value,
        })
    }

    fn wait(&self, fence: &Fence, value: u64) -> Result<()> {
        fence.wait(value);
        match self
            .shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        self.ensure_live(buffer)?;
        let (reply, rx) = mpsc::channel();
        self.send(Job::Read {
            buffer: buffer.id(),
            reply,
        })?;
        rx.recv()
            .map_err(|_| Error::DeviceLost("queue thread exited".into()))?
    }
}

// ---------------------------------------------------------------------------
// Queue thread
// ---------------------------------------------------------------------------

fn run_queue(jobs: Receiver<Job>, registry: Registry, shared: Arc<Shared>, validation: bool) {
    let mut mirror = StateMirror::default();
    for job in jobs {
        match job {
            Job::Batch { batch, fence, value } => {
                let result = execute_batch(&batch, &registry, &shared, validation.then_some(&mut mirror));
                if let Err(err) = result {
                    tracing::warn!("batch {value} failed: {err}");
                    let mut failure = shared.failure.lock().unwrap_or_else(PoisonError::into_inner);
                    failure.get_or_insert(err);
                }
                fence.signal(value);
            }
            Job::Write {
                buffer,
                word_offset,
                words,
            } => {
                if let Some(storage) = lookup(&registry, buffer) {
                    for (slot, word) in storage.iter().skip(word_offset).zip(words) {
                        slot.store(word, Ordering::Relaxed);
                    }
                }
            }
            Job::Read { buffer, reply } => {
                let result = lookup(&registry, buffer)
                    .map(|storage| {
                        storage
                            .iter()
                            .flat_map(|w| w.load(Ordering::Relaxed).to_ne_bytes())
                            .collect()
                    })
                    .ok_or(Error::UnknownBuffer(buffer));
                let _ = reply.send(result);
            }
            Job::Release(buffer) => {
                registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&buffer);
                mirror.states.remove(&buffer);
            }
        }
    }
}

fn lookup(registry: &Registry, buffer: BufferId) -> Option<Storage> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&buffer)
        .cloned()
}

/// Run a batch. After the first failure the remaining dispatches are
/// skipped, but every barrier is still applied to the mirror so it keeps
/// agreeing with the host tracker for the batches that follow.
fn execute_batch(
    batch: &CommandBatch,
    registry: &Registry,
    shared: &Shared,
    mut mirror: Option<&mut StateMirror>,
) -> Result<()> {
    let mut failure = None;
    for command in batch.commands() {
        match command {
            // Dispatches run to completion one after another, so a barrier
            // has nothing left to drain here.
            Command::Barrier(barriers) => {
                if let Some(mirror) = mirror.as_deref_mut() {
                    for barrier in barriers {
                        if let Err(err) = mirror.apply(barrier) {
                            failure.get_or_insert(err);
                        }
                    }
                }
            }
            Command::Dispatch(pass) => {
                if failure.is_none() {
                    let checked = match mirror.as_deref_mut() {
                        Some(mirror) => mirror.check(pass),
                        None => Ok(()),
                    };
                    if let Err(err) = checked.and_then(|()| execute_pass(pass, registry, shared)) {
                        failure = Some(err);
                    }
                }
                if let Some(mirror) = mirror.as_deref_mut() {
                    mirror.record(pass);
                }
            }
        }
    }
    failure.map_or(Ok(()), Err)
}

fn execute_pass(pass: &Pass, registry: &Registry, shared: &Shared) -> Result<()> {
    let desc = pass.kernel.desc();
    let mut bound = Vec::with_capacity(pass.bindings.len());
    for view in &pass.bindings {
        let words = lookup(registry, view.buffer).ok_or(Error::UnknownBuffer(view.buffer))?;
        let start = ((view.offset / 4) as usize).min(words.len());
        let len = ((view.size / 4) as usize).min(words.len() - start);
        bound.push(Bound {
            words,
            range: start..start + len,
            access: view.access,
        });
    }
    let violation = AtomicBool::new(false);
    let args = KernelArgs {
        bindings: &bound,
        constants: &pass.constants,
        violation: &violation,
    };

    match pass.shape {
        DispatchShape::Direct(groups) => run_groups(pass.kernel, groups, desc.workgroup_size, &args)?,
        DispatchShape::Indirect(addr) => {
            let record: DispatchArgs = read_argument(registry, addr)?;
            run_groups(pass.kernel, [record.x, record.y, record.z], desc.workgroup_size, &args)?;
        }
        DispatchShape::DrawIndirect(addr) => {
            let record: DrawArgs = read_argument(registry, addr)?;
            let clip_positions = surface::draw(&args, &record);
            shared
                .draws
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(DrawOutput {
                    args: record,
                    clip_positions,
                });
        }
    }

    if violation.load(Ordering::Relaxed) {
        return Err(Error::Validation(format!(
            "kernel `{}` wrote through a read-only binding",
            desc.label
        )));
    }
    Ok(())
}

fn read_argument<T: bytemuck::Pod>(registry: &Registry, addr: RawAddress) -> Result<T> {
    let storage = lookup(registry, addr.buffer).ok_or(Error::UnknownBuffer(addr.buffer))?;
    let first = (addr.offset / 4) as usize;
    let count = std::mem::size_of::<T>() / 4;
    if addr.offset % 4 != 0 || first + count > storage.len() {
        return Err(Error::Validation(format!(
            "indirect argument at byte {} is out of bounds",
            addr.offset
        )));
    }
    let words: Vec<u32> = storage[first..first + count]
        .iter()
        .map(|w| w.load(Ordering::Acquire))
        .collect();
    Ok(bytemuck::pod_read_unaligned(bytemuck::cast_slice(&words)))
}

type GroupFn = fn(Workgroup, &KernelArgs<'_>);

fn group_fn(kernel: KernelId) -> Option<GroupFn> {
    Some(match kernel {
        KernelId::BufferClear => buffer_clear,
        KernelId::DispatchArgDivide => surface::dispatch_arg_divide,
        KernelId::BilevelGrid => surface::bilevel_grid,
        KernelId::SurfaceBlockDetection => surface::block_detection,
        KernelId::SurfaceCellDetection => surface::cell_detection,
        KernelId::SurfaceVertexCompaction => surface::vertex_compaction,
        KernelId::SurfaceVertexDensity => surface::vertex_density,
        KernelId::SurfaceVertexNormal => surface::vertex_normal,
        KernelId::SetIndirectArgs => bukkit::set_indirect_args,
        KernelId::BukkitCount => bukkit::count,
        KernelId::BukkitAllocate => bukkit::allocate,
        KernelId::BukkitInsert => bukkit::insert,
        KernelId::Emission => bukkit::emission,
        KernelId::ParticleRelease => bukkit::release,
        KernelId::G2P2G => bukkit::g2p2g,
        KernelId::SurfaceDraw => return None,
    })
}

fn run_groups(kernel: KernelId, groups: [u32; 3], size: u32, args: &KernelArgs<'_>) -> Result<()> {
    if groups.iter().any(|&g| g > MAX_GROUPS_PER_AXIS) {
        return Err(Error::Validation(format!(
            "kernel `{}` launched with {:?} groups",
            kernel.desc().label,
            groups
        )));
    }
    let Some(body) = group_fn(kernel) else {
        return Err(Error::Validation(format!(
            "kernel `{}` is not a compute kernel",
            kernel.desc().label
        )));
    };
    let [x, y, z] = groups;
    let total = x as u64 * y as u64 * z as u64;
    (0..total).into_par_iter().for_each(|g| {
        let id = [
            (g % x as u64) as u32,
            ((g / x as u64) % y as u64) as u32,
            (g / (x as u64 * y as u64)) as u32,
        ];
        body(Workgroup { id, groups, size }, args);
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Kernel-side view of a launch
// ---------------------------------------------------------------------------

/// One work group of a launch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Workgroup {
    pub id: [u32; 3],
    /// Launch shape, for unfolding the linear index.
    pub groups: [u32; 3],
    pub size: u32,
}

impl Workgroup {
    /// Linear index of this group in a folded 1D launch, x fastest.
    pub fn index(&self) -> u32 {
        self.id[0] + self.groups[0] * (self.id[1] + self.groups[1] * self.id[2])
    }

    /// Global invocation ids of this group.
    pub fn invocations(&self) -> Range<u32> {
        let first = self.index().saturating_mul(self.size);
        first..first.saturating_add(self.size)
    }

    /// Local invocation ids.
    pub fn locals(&self) -> Range<u32> {
        0..self.size
    }
}

struct Bound {
    words: Storage,
    range: Range<usize>,
    access: Access,
}

/// Bindings and constants of a launch, addressed the way a shader would:
/// binding slot plus word index. Out-of-range loads return 0 and
/// out-of-range stores are dropped, like robust buffer access.
pub(crate) struct KernelArgs<'a> {
    bindings: &'a [Bound],
    constants: &'a [u8],
    violation: &'a AtomicBool,
}

impl KernelArgs<'_> {
    pub fn constants<T: bytemuck::Pod>(&self) -> T {
        self.constants
            .get(..std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .unwrap_or_else(T::zeroed)
    }

    /// Length of a binding in words.
    pub fn len(&self, binding: usize) -> usize {
        self.bindings.get(binding).map_or(0, |b| b.range.len())
    }

    fn word(&self, binding: usize, index: usize) -> Option<&AtomicU32> {
        let bound = self.bindings.get(binding)?;
        if index >= bound.range.len() {
            return None;
        }
        bound.words.get(bound.range.start + index)
    }

    fn writable(&self, binding: usize, index: usize) -> Option<&AtomicU32> {
        if self.bindings.get(binding)?.access != Access::ReadWrite {
            self.violation.store(true, Ordering::Relaxed);
            return None;
        }
        self.word(binding, index)
    }

    pub fn load(&self, binding: usize, index: usize) -> u32 {
        self.word(binding, index).map_or(0, |w| w.load(Ordering::Relaxed))
    }

    pub fn load_f32(&self, binding: usize, index: usize) -> f32 {
        f32::from_bits(self.load(binding, index))
    }

    pub fn store(&self, binding: usize, index: usize, value: u32) {
        if let Some(w) = self.writable(binding, index) {
            w.store(value, Ordering::Relaxed);
        }
    }

    pub fn store_f32(&self, binding: usize, index: usize, value: f32) {
        self.store(binding, index, value.to_bits());
    }

    pub fn atomic_add(&self, binding: usize, index: usize, value: u32) -> u32 {
        self.writable(binding, index)
            .map_or(0, |w| w.fetch_add(value, Ordering::AcqRel))
    }

    pub fn atomic_sub(&self, binding: usize, index: usize, value: u32) -> u32 {
        self.writable(binding, index)
            .map_or(0, |w| w.fetch_sub(value, Ordering::AcqRel))
    }

    pub fn atomic_max(&self, binding: usize, index: usize, value: u32) -> u32 {
        self.writable(binding, index)
            .map_or(0, |w| w.fetch_max(value, Ordering::AcqRel))
    }

    pub fn atomic_exchange(&self, binding: usize, index: usize, value: u32) -> u32 {
        self.writable(binding, index)
            .map_or(0, |w| w.swap(value, Ordering::AcqRel))
    }

    /// Returns whether `current` was replaced by `new`.
    pub fn compare_exchange(&self, binding: usize, index: usize, current: u32, new: u32) -> bool {
        self.writable(binding, index).is_some_and(|w| {
            w.compare_exchange(current, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Load element `index` of a binding holding `T` records.
    pub fn read<T: bytemuck::Pod>(&self, binding: usize, index: usize) -> T {
        let n = std::mem::size_of::<T>() / 4;
        let mut words = [0u32; 32];
        if n == 0 || n > words.len() {
            return T::zeroed();
        }
        for (k, word) in words[..n].iter_mut().enumerate() {
            *word = self.load(binding, index * n + k);
        }
        let bytes: &[u8] = bytemuck::cast_slice(&words[..n]);
        bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()])
    }

    /// Store element `index` of a binding holding `T` records.
    pub fn write<T: bytemuck::Pod>(&self, binding: usize, index: usize, value: &T) {
        let n = std::mem::size_of::<T>() / 4;
        for (k, chunk) in bytemuck::bytes_of(value).chunks_exact(4).enumerate() {
            self.store(
                binding,
                index * n + k,
                u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            );
        }
    }
}

fn buffer_clear(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: ClearConstants = args.constants();
    for i in wg.invocations() {
        if i < c.count {
            args.store(0, i as usize, c.value);
        }
    }
}

// ---------------------------------------------------------------------------
// Validation layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Mirrored {
    state: ResourceState,
    written: bool,
}

#[derive(Debug, Default)]
struct StateMirror {
    states: HashMap<BufferId, Mirrored>,
}

impl StateMirror {
    fn entry(&mut self, buffer: BufferId) -> &mut Mirrored {
        self.states.entry(buffer).or_insert(Mirrored {
            state: ResourceState::ReadWrite,
            written: false,
        })
    }

    fn apply(&mut self, barrier: &Barrier) -> Result<()> {
        match *barrier {
            Barrier::Transition { buffer, before, after } => {
                let entry = self.entry(buffer);
                let found = entry.state;
                entry.state = after;
                entry.written = false;
                if found != before {
                    return Err(Error::Validation(format!(
                        "transition of {buffer:?} from {before:?}, but the device has it in {found:?}"
                    )));
                }
            }
            Barrier::Uav { buffer } => {
                let entry = self.entry(buffer);
                if entry.state != ResourceState::ReadWrite {
                    return Err(Error::Validation(format!(
                        "UAV barrier on {buffer:?} in {:?}",
                        entry.state
                    )));
                }
                entry.written = false;
            }
        }
        Ok(())
    }

    fn check(&mut self, pass: &Pass) -> Result<()> {
        let label = pass.kernel.desc().label;
        for req in pass.requirements() {
            let entry = *self.entry(req.buffer);
            if entry.state != req.state {
                return Err(Error::Validation(format!(
                    "`{label}` needs {:?} in {:?}, device has {:?}",
                    req.buffer, req.state, entry.state
                )));
            }
            if req.state == ResourceState::ReadWrite && entry.written {
                return Err(Error::Validation(format!(
                    "`{label}` reuses {:?} without draining its previous writer",
                    req.buffer
                )));
            }
        }
        Ok(())
    }

    fn record(&mut self, pass: &Pass) {
        for req in pass.requirements() {
            if req.state == ResourceState::ReadWrite {
                self.entry(req.buffer).written = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ComputeContext;
    use crate::kernels::DivideConstants;

    #[test]
    fn clear_fills_only_the_requested_words() {
        let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
        let buf = ctx.create_buffer_init("words", &[7u32; 100]).unwrap();
        ctx.dispatch(
            Pass::new(KernelId::BufferClear)
                .bind(buf.write_view())
                .constants(&ClearConstants {
                    count: 70,
                    value: 3,
                    ..Default::default()
                })
                .groups(2),
        )
        .unwrap();
        ctx.submit_and_wait().unwrap();
        let words: Vec<u32> = ctx.read_buffer(&buf).unwrap();
        assert!(words[..70].iter().all(|&w| w == 3));
        assert!(words[70..].iter().all(|&w| w == 7));
    }

    #[test]
    fn indirect_shape_is_read_at_dispatch_time() {
        let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
        let count = ctx.create_buffer_init("count", &[130u32]).unwrap();
        let dispatch = ctx.create_buffer_zeroed::<DispatchArgs>("dispatch", 2).unwrap();
        let draw = ctx.create_buffer_zeroed::<DrawArgs>("draw", 1).unwrap();
        let target = ctx.create_buffer_init("target", &[0u32; 256]).unwrap();

        ctx.dispatch(
            Pass::new(KernelId::DispatchArgDivide)
                .bind(count.read_view())
                .bind(dispatch.write_view())
                .bind(draw.write_view())
                .constants(&DivideConstants {
                    divisor: 64,
                    ..Default::default()
                })
                .groups(1),
        )
        .unwrap();
        // Clearing with a host-unknown shape: 3 groups of 64 from 130 / 64.
        ctx.dispatch(
            Pass::new(KernelId::BufferClear)
                .bind(target.write_view())
                .constants(&ClearConstants {
                    count: 256,
                    value: 1,
                    ..Default::default()
                })
                .indirect(dispatch.raw_address().offset(DispatchArgs::SIZE)),
        )
        .unwrap();
        ctx.submit_and_wait().unwrap();

        let records: Vec<DispatchArgs> = ctx.read_buffer(&dispatch).unwrap();
        assert_eq!(records, vec![DispatchArgs::linear(3); 2]);
        let words: Vec<u32> = ctx.read_buffer(&target).unwrap();
        assert_eq!(words.iter().filter(|&&w| w == 1).count(), 192);
        assert_eq!(ctx.buffer_state(dispatch.id()), Some(ResourceState::ReadWrite));
    }

    #[test]
    fn validation_rejects_a_batch_without_barriers() {
        let mut device = CpuDevice::with_validation().unwrap();
        let buf = device.create_buffer(&BufferDesc::of::<u32>("a", 4), None).unwrap();
        let clear = Pass::new(KernelId::BufferClear)
            .bind(buf.write_view())
            .constants(&ClearConstants::default())
            .groups(1);
        // Two writers back to back, hand-recorded with no drain between.
        let mut batch = CommandBatch::new();
        batch.dispatch(clear.clone());
        batch.dispatch(clear);
        let fence = Fence::new();
        device.submit(&batch, &fence, 1).unwrap();
        assert!(matches!(device.wait(&fence, 1), Err(Error::Validation(_))));
    }

    #[test]
    fn writes_and_reads_are_queue_ordered() {
        let mut ctx = ComputeContext::new(CpuDevice::new(CpuDeviceOptions::default()).unwrap());
        let buf = ctx.create_buffer_zeroed::<u32>("a", 4).unwrap();
        ctx.write_buffer(&buf, 1, &[5u32, 6]).unwrap();
        let words: Vec<u32> = ctx.read_buffer(&buf).unwrap();
        assert_eq!(words, vec![0, 5, 6, 0]);
        assert!(ctx.write_buffer(&buf, 3, &[1u32, 2]).is_err());
    }
}
