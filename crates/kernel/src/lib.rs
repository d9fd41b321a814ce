//! GPU compute orchestration for particle binning and fluid surface extraction.
//!
//! Chains of data-parallel kernels where each launch is sized by a record the
//! previous kernel wrote on the device, with a per-buffer hazard state
//! machine inserting the barriers between them.
//!
//! # Modules
//! - [`buffer`] -- Fixed-capacity device buffers, read/write views and raw addresses.
//! - [`hazard`] -- Per-buffer access state and barrier generation.
//! - [`batch`] -- Passes, command batches and indirect argument records.
//! - [`fence`] -- Monotonic completion fence.
//! - [`kernels`] -- Kernel table: binding ABI, workgroup sizes, constant blocks.
//! - [`context`] -- Explicit compute context tying the above to a device.
//! - [`cpu`] -- Reference executor with a validation layer.
//! - [`surface`] -- Six-stage surface extraction pipeline.
//! - [`bukkit`] -- Three-phase spatial binning pipeline.
//! - [`simulation`] -- Particle lifecycle and the binned simulation step.

#![warn(missing_docs)]

pub mod batch;
pub mod buffer;
pub mod bukkit;
pub mod context;
pub mod cpu;
pub mod device;
pub mod error;
pub mod fence;
pub mod hazard;
pub mod kernels;
pub mod particle;
pub mod simulation;
pub mod smoothing;
pub mod surface;

#[cfg(feature = "gpu")]
#[allow(missing_docs)]
pub mod gpu;

pub use batch::{Command, CommandBatch, DispatchArgs, DispatchShape, DrawArgs, Pass};
pub use buffer::{Access, BufferDesc, BufferId, BufferView, GpuBuffer, RawAddress};
pub use bukkit::{BukkitSnapshot, BukkitSystem, BukkitThreadData};
pub use context::{ComputeContext, ContextStats, SubmitPolicy};
pub use cpu::{CpuDevice, CpuDeviceOptions, DrawOutput};
pub use device::ComputeDevice;
pub use error::{Error, Result};
pub use fence::Fence;
pub use hazard::{Barrier, ResourceState, ResourceTracker};
pub use kernels::{CameraConstants, GridConstants, KernelId, SimConstants};
pub use particle::{Material, Particle, ParticleArena, ShapeFunction, ShapeType, SimShape};
pub use simulation::{ParticleSimulation, ParticleSnapshot, SimulationParams};
pub use smoothing::{wendland_c2, wendland_c2_gradient};
pub use surface::{SurfaceExtraction, SurfaceGrid, SurfaceSnapshot};

#[cfg(feature = "gpu")]
pub use gpu::WgpuDevice;
