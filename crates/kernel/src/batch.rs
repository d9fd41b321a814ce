//! Command batches: ordered barriers and dispatches submitted as one unit.

use crate::buffer::{Access, BufferView, RawAddress};
use crate::hazard::{Barrier, Requirement, ResourceState};
use crate::kernels::{KernelId, MAX_GROUPS_PER_AXIS};

/// Indirect dispatch record: work-group counts along x, y, z.
///
/// Byte-compatible with `dispatch_workgroups_indirect` and D3D12
/// `ExecuteIndirect` dispatch signatures (12 bytes, no padding).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchArgs {
    /// Work groups along x.
    pub x: u32,
    /// Work groups along y.
    pub y: u32,
    /// Work groups along z.
    pub z: u32,
}

impl DispatchArgs {
    /// Size of one record in bytes.
    pub const SIZE: u64 = 12;

    /// Record launching `x` groups in a line.
    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Record launching `groups` groups of a 1D kernel, folded onto y once
    /// x reaches [`MAX_GROUPS_PER_AXIS`]. Kernels rebuild the linear group
    /// index and skip the tail past their element count.
    pub fn folded(groups: u32) -> Self {
        Self {
            x: groups.min(MAX_GROUPS_PER_AXIS),
            y: groups.div_ceil(MAX_GROUPS_PER_AXIS).max(1),
            z: 1,
        }
    }

    /// The record as a direct launch shape.
    pub fn shape(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Total number of work groups.
    pub fn groups(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Indirect draw record (non-indexed).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawArgs {
    /// Vertices per instance.
    pub vertex_count: u32,
    /// Number of instances.
    pub instance_count: u32,
    /// First vertex.
    pub first_vertex: u32,
    /// First instance.
    pub first_instance: u32,
}

/// Where a pass gets its launch shape from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchShape {
    /// Host-supplied work-group counts.
    Direct([u32; 3]),
    /// A [`DispatchArgs`] record read on the device at dispatch time.
    Indirect(RawAddress),
    /// A [`DrawArgs`] record read on the device at draw time.
    DrawIndirect(RawAddress),
}

impl DispatchShape {
    /// The argument buffer address, for indirect shapes.
    pub fn argument(&self) -> Option<RawAddress> {
        match *self {
            DispatchShape::Direct(_) => None,
            DispatchShape::Indirect(addr) | DispatchShape::DrawIndirect(addr) => Some(addr),
        }
    }
}

/// One kernel launch: its bindings in ABI order, its constant block and its
/// launch shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    /// Kernel to launch.
    pub kernel: KernelId,
    /// Buffer bindings in the order the kernel declares them.
    pub bindings: Vec<BufferView>,
    /// Raw bytes of the constant block.
    pub constants: Vec<u8>,
    /// Launch shape.
    pub shape: DispatchShape,
}

impl Pass {
    /// Start a pass for `kernel` with no bindings and an empty launch.
    pub fn new(kernel: KernelId) -> Self {
        Self {
            kernel,
            bindings: Vec::new(),
            constants: Vec::new(),
            shape: DispatchShape::Direct([0, 1, 1]),
        }
    }

    /// Append the next binding.
    pub fn bind(mut self, view: BufferView) -> Self {
        self.bindings.push(view);
        self
    }

    /// Set the constant block.
    pub fn constants<T: bytemuck::Pod>(mut self, value: &T) -> Self {
        self.constants = bytemuck::bytes_of(value).to_vec();
        self
    }

    /// Launch `groups` work groups of a 1D kernel, see [`DispatchArgs::folded`].
    pub fn groups(self, groups: u32) -> Self {
        self.direct(DispatchArgs::folded(groups).shape())
    }

    /// Launch a host-sized grid of work groups.
    pub fn direct(mut self, groups: [u32; 3]) -> Self {
        self.shape = DispatchShape::Direct(groups);
        self
    }

    /// Launch with the shape stored at `args`.
    pub fn indirect(mut self, args: RawAddress) -> Self {
        self.shape = DispatchShape::Indirect(args);
        self
    }

    /// Draw with the record stored at `args`.
    pub fn draw_indirect(mut self, args: RawAddress) -> Self {
        self.shape = DispatchShape::DrawIndirect(args);
        self
    }

    /// The `{buffer, requiredState}` table of this pass.
    pub fn requirements(&self) -> Vec<Requirement> {
        let mut reqs: Vec<Requirement> = self
            .bindings
            .iter()
            .map(|view| Requirement {
                buffer: view.buffer,
                state: match view.access {
                    Access::Read => ResourceState::ReadOnly,
                    Access::ReadWrite => ResourceState::ReadWrite,
                },
            })
            .collect();
        if let Some(args) = self.shape.argument() {
            reqs.push(Requirement {
                buffer: args.buffer,
                state: ResourceState::IndirectArgument,
            });
        }
        reqs
    }
}

/// A recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// One barrier point. All listed barriers complete before anything after.
    Barrier(Vec<Barrier>),
    /// A compute dispatch or an indirect draw.
    Dispatch(Pass),
}

/// Ordered list of commands submitted to the queue as one unit.
///
/// A batch is recycled: after submission it is reset in place and reused for
/// the next segment of the frame.
#[derive(Debug, Clone, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
}

impl CommandBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded commands.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record a barrier point. Empty lists are skipped.
    pub fn barrier(&mut self, barriers: Vec<Barrier>) {
        if !barriers.is_empty() {
            self.commands.push(Command::Barrier(barriers));
        }
    }

    /// Record a pass.
    pub fn dispatch(&mut self, pass: Pass) {
        self.commands.push(Command::Dispatch(pass));
    }

    /// Drop recorded commands, keeping the allocation.
    pub fn reset(&mut self) {
        self.commands.clear();
    }
}
