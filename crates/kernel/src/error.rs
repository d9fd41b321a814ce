//! Error type shared by every compute backend.

use crate::buffer::BufferId;
use crate::hazard::ResourceState;

/// Errors raised while creating resources or recording and executing work.
///
/// Capacity overflow is deliberately absent: cells and bins that receive more
/// entries than they can hold drop the excess and bump a debug counter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No adapter matched the requested options.
    #[error("no suitable GPU adapter found")]
    AdapterUnavailable,

    /// The adapter refused to create a logical device.
    #[error("failed to create device: {0}")]
    DeviceRequest(String),

    /// A buffer or pipeline could not be created. Fatal for scene setup.
    #[error("failed to create {label}: {reason}")]
    ResourceCreation {
        /// Debug label of the resource.
        label: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// Mapping a staging buffer for readback failed.
    #[error("buffer readback failed: {0}")]
    BufferMap(String),

    /// The handle does not name a live buffer on this device.
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),

    /// A pass does not match the binding table of its kernel.
    #[error("binding mismatch for kernel `{kernel}`: {reason}")]
    BindingMismatch {
        /// Kernel label.
        kernel: &'static str,
        /// What did not match.
        reason: String,
    },

    /// One pass needs the same buffer in two different states.
    #[error("buffer {buffer:?} required as both {first:?} and {second:?} in one pass")]
    HazardConflict {
        /// Buffer in question.
        buffer: BufferId,
        /// State requested first.
        first: ResourceState,
        /// Conflicting state requested later.
        second: ResourceState,
    },

    /// The validation layer rejected a submitted batch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The executor stopped accepting work.
    #[error("device lost: {0}")]
    DeviceLost(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
