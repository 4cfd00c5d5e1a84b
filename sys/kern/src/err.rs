// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Each component reports its own failures through a small `Copy` enum, and
//! the lifecycle controller folds them into `LifecycleError` with `?`. The only
//! failure that is not returned is heap corruption, which goes through
//! `fail::die`.

use core::fmt;

use abi::HeaderError;

/// Heap manager failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeapError {
    /// No free block is large enough, or the request itself was unusable
    /// (zero, flagged, or overflowing once the header is added).
    OutOfMemory,
    /// The allocation was routed to a slot with no user region bound.
    NotBound,
    /// A user region would overlap another live user region.
    Overlap,
    /// A user region would fall outside user RAM or hold no usable block.
    BadRegion,
}

/// Failures reported by the scheduler primitives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedError {
    /// The task's stack or control block could not be allocated.
    OutOfMemory,
    /// The scheduler did not confirm a deletion within the allowed ticks.
    Timeout,
}

/// Task registry failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    AllSlotsFull,
    /// The slot's task list is full; nothing was created.
    ResourceExhausted,
    /// The slot has been cleared since this id was handed out.
    StaleSlot,
    /// The slot holds no application.
    Empty,
    Sched(SchedError),
}

impl From<SchedError> for RegistryError {
    fn from(e: SchedError) -> Self {
        Self::Sched(e)
    }
}

/// Interrupt router failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqError {
    /// The hardware refused the vector, or another live application owns it.
    Rejected,
}

/// Binary loader failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    /// No image by that name on storage.
    NotFound,
    /// Storage could not be read.
    Io,
    BadHeader(HeaderError),
}

impl From<HeaderError> for LoadError {
    fn from(e: HeaderError) -> Self {
        Self::BadHeader(e)
    }
}

/// Everything the lifecycle controller can report to its caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LifecycleError {
    AllSlotsFull,
    /// No application is loaded under that slot or name.
    NotFound,
    LoadFailure(LoadError),
    /// Per-application task limit reached.
    ResourceExhausted,
    OutOfMemory,
    /// Cleanup finished, but the scheduler did not confirm every deletion in
    /// time.
    DeleteTimeout,
    StaleSlot,
    Heap(HeapError),
    Irq(IrqError),
}

impl From<RegistryError> for LifecycleError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AllSlotsFull => Self::AllSlotsFull,
            RegistryError::ResourceExhausted => Self::ResourceExhausted,
            RegistryError::StaleSlot => Self::StaleSlot,
            RegistryError::Empty => Self::NotFound,
            RegistryError::Sched(SchedError::OutOfMemory) => Self::OutOfMemory,
            RegistryError::Sched(SchedError::Timeout) => Self::DeleteTimeout,
        }
    }
}

impl From<HeapError> for LifecycleError {
    fn from(e: HeapError) -> Self {
        match e {
            HeapError::OutOfMemory => Self::OutOfMemory,
            e => Self::Heap(e),
        }
    }
}

impl From<LoadError> for LifecycleError {
    fn from(e: LoadError) -> Self {
        Self::LoadFailure(e)
    }
}

impl From<IrqError> for LifecycleError {
    fn from(e: IrqError) -> Self {
        Self::Irq(e)
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllSlotsFull => f.write_str("maximum apps reached"),
            Self::NotFound => f.write_str("no such app"),
            Self::LoadFailure(LoadError::NotFound) => {
                f.write_str("load failure: application not found")
            }
            Self::LoadFailure(LoadError::Io) => {
                f.write_str("load failure: storage read error")
            }
            Self::LoadFailure(LoadError::BadHeader(h)) => {
                write!(f, "load failure: bad image header ({h:?})")
            }
            Self::ResourceExhausted => f.write_str("task limit reached"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::DeleteTimeout => f.write_str("task deletion timed out"),
            Self::StaleSlot => f.write_str("stale slot"),
            Self::Heap(h) => write!(f, "heap error ({h:?})"),
            Self::Irq(IrqError::Rejected) => f.write_str("interrupt rejected"),
        }
    }
}
