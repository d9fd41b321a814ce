//! Resource hazard state machine.
//!
//! Every buffer carries a recorded state. Before a pass is recorded the
//! tracker compares the states the pass needs against the recorded ones and
//! returns the barriers that reconcile them, batched into a single barrier
//! point. This is the only place where transitions are decided.
//!
//! Rules:
//! - state differs from the requirement: transition barrier;
//! - requirement is read-write, state is read-write and a previous pass
//!   wrote the buffer: write-drain (UAV) barrier;
//! - anything else: nothing.
//!
//! A buffer touched only inside one kernel (atomics) therefore never needs a
//! barrier, and two consecutive read-only consumers share one transition.

use std::collections::HashMap;

use crate::buffer::BufferId;
use crate::error::{Error, Result};

/// Access state of a buffer as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Unordered access: loads, stores and atomics.
    ReadWrite,
    /// Shader resource: loads only.
    ReadOnly,
    /// Source of an indirect launch shape.
    IndirectArgument,
}

/// A synchronization point recorded into a command batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Change the access state of a buffer. Drains all prior writers.
    Transition {
        /// Buffer being transitioned.
        buffer: BufferId,
        /// Recorded state before the barrier.
        before: ResourceState,
        /// State after the barrier.
        after: ResourceState,
    },
    /// Drain prior writers of a buffer that stays read-write.
    Uav {
        /// Buffer being drained.
        buffer: BufferId,
    },
}

impl Barrier {
    /// Buffer the barrier applies to.
    pub fn buffer(&self) -> BufferId {
        match *self {
            Barrier::Transition { buffer, .. } | Barrier::Uav { buffer } => buffer,
        }
    }
}

/// One row of a pass's `{buffer, requiredState}` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    /// Buffer touched by the pass.
    pub buffer: BufferId,
    /// State it must be in when the pass runs.
    pub state: ResourceState,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: ResourceState,
    written: bool,
}

/// Per-context record of buffer states.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    buffers: HashMap<BufferId, Tracked>,
}

impl ResourceTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly created buffer. Buffers are born read-write.
    pub fn register(&mut self, buffer: BufferId) {
        self.buffers.insert(
            buffer,
            Tracked {
                state: ResourceState::ReadWrite,
                written: false,
            },
        );
    }

    /// Stop tracking a released buffer.
    pub fn forget(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    /// Recorded state of `buffer`, if tracked.
    pub fn state(&self, buffer: BufferId) -> Option<ResourceState> {
        self.buffers.get(&buffer).map(|t| t.state)
    }

    /// Compute the batched barrier list for a pass and update recorded state.
    ///
    /// Rows naming the same buffer twice must agree on the state.
    pub fn prepare(&mut self, requirements: &[Requirement]) -> Result<Vec<Barrier>> {
        let mut wanted: Vec<Requirement> = Vec::with_capacity(requirements.len());
        for req in requirements {
            match wanted.iter().find(|w| w.buffer == req.buffer) {
                Some(prev) if prev.state != req.state => {
                    return Err(Error::HazardConflict {
                        buffer: req.buffer,
                        first: prev.state,
                        second: req.state,
                    });
                }
                Some(_) => {}
                None => wanted.push(*req),
            }
        }

        if let Some(missing) = wanted.iter().find(|w| !self.buffers.contains_key(&w.buffer)) {
            return Err(Error::UnknownBuffer(missing.buffer));
        }

        let mut barriers = Vec::new();
        for req in &wanted {
            let Some(tracked) = self.buffers.get_mut(&req.buffer) else {
                continue;
            };
            if tracked.state != req.state {
                barriers.push(Barrier::Transition {
                    buffer: req.buffer,
                    before: tracked.state,
                    after: req.state,
                });
                tracked.state = req.state;
                tracked.written = false;
            } else if req.state == ResourceState::ReadWrite && tracked.written {
                barriers.push(Barrier::Uav { buffer: req.buffer });
                tracked.written = false;
            }
        }
        Ok(barriers)
    }

    /// Mark read-write rows of a recorded pass as written.
    pub fn commit(&mut self, requirements: &[Requirement]) {
        for req in requirements {
            if req.state == ResourceState::ReadWrite {
                if let Some(tracked) = self.buffers.get_mut(&req.buffer) {
                    tracked.written = true;
                }
            }
        }
    }

    /// Return an indirect-argument buffer to read-write right after its
    /// consuming dispatch, so it can be reused as a scratch accumulator.
    pub fn release_indirect(&mut self, buffer: BufferId) -> Option<Barrier> {
        let tracked = self.buffers.get_mut(&buffer)?;
        if tracked.state != ResourceState::IndirectArgument {
            return None;
        }
        tracked.state = ResourceState::ReadWrite;
        tracked.written = false;
        Some(Barrier::Transition {
            buffer,
            before: ResourceState::IndirectArgument,
            after: ResourceState::ReadWrite,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceState::*;

    fn req(id: u32, state: ResourceState) -> Requirement {
        Requirement {
            buffer: BufferId(id),
            state,
        }
    }

    fn tracker(ids: &[u32]) -> ResourceTracker {
        let mut t = ResourceTracker::new();
        for &id in ids {
            t.register(BufferId(id));
        }
        t
    }

    #[test]
    fn same_kernel_atomics_need_no_barrier() {
        let mut t = tracker(&[0]);
        let reqs = [req(0, ReadWrite)];
        assert!(t.prepare(&reqs).unwrap().is_empty());
        t.commit(&reqs);
        assert_eq!(t.state(BufferId(0)), Some(ReadWrite));
    }

    #[test]
    fn writer_then_reader_emits_one_transition() {
        let mut t = tracker(&[0, 1]);
        let write = [req(0, ReadWrite), req(1, ReadWrite)];
        t.prepare(&write).unwrap();
        t.commit(&write);

        let read = [req(0, ReadOnly), req(1, ReadOnly)];
        let barriers = t.prepare(&read).unwrap();
        assert_eq!(barriers.len(), 2);
        assert!(barriers.iter().all(|b| matches!(
            b,
            Barrier::Transition { before: ReadWrite, after: ReadOnly, .. }
        )));

        // A second reader sees the buffers already in the right state.
        assert!(t.prepare(&read).unwrap().is_empty());
    }

    #[test]
    fn writer_then_writer_drains() {
        let mut t = tracker(&[5]);
        let rw = [req(5, ReadWrite)];
        t.prepare(&rw).unwrap();
        t.commit(&rw);
        assert_eq!(
            t.prepare(&rw).unwrap(),
            vec![Barrier::Uav { buffer: BufferId(5) }]
        );
        // Nothing was written since the drain.
        assert!(t.prepare(&rw).unwrap().is_empty());
    }

    #[test]
    fn indirect_source_round_trips_to_read_write() {
        let mut t = tracker(&[2]);
        let produce = [req(2, ReadWrite)];
        t.prepare(&produce).unwrap();
        t.commit(&produce);

        let consume = [req(2, IndirectArgument)];
        let barriers = t.prepare(&consume).unwrap();
        assert_eq!(
            barriers,
            vec![Barrier::Transition {
                buffer: BufferId(2),
                before: ReadWrite,
                after: IndirectArgument
            }]
        );
        t.commit(&consume);
        assert!(t.release_indirect(BufferId(2)).is_some());
        assert_eq!(t.state(BufferId(2)), Some(ReadWrite));
        assert!(t.release_indirect(BufferId(2)).is_none());

        // Reused as a scratch accumulator next step without a drain.
        assert!(t.prepare(&produce).unwrap().is_empty());
    }

    #[test]
    fn conflicting_rows_are_rejected() {
        let mut t = tracker(&[0]);
        let err = t
            .prepare(&[req(0, ReadOnly), req(0, IndirectArgument)])
            .unwrap_err();
        assert!(matches!(err, Error::HazardConflict { .. }));
        // The failed pass left the recorded state alone.
        assert_eq!(t.state(BufferId(0)), Some(ReadWrite));
    }

    #[test]
    fn unknown_buffers_are_rejected() {
        let mut t = tracker(&[]);
        assert!(matches!(
            t.prepare(&[req(9, ReadOnly)]),
            Err(Error::UnknownBuffer(BufferId(9)))
        ));
    }
}
