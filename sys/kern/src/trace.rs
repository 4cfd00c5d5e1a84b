// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Events recorded in the kernel's ring buffer.

use abi::{EntryPoint, SlotId, TaskHandle, Vector};

use crate::err::{HeapError, LoadError};
use crate::heap::RegionId;

/// Ring buffer depth.
pub const TRACE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Loaded { slot: SlotId, entry: EntryPoint, heap_start: usize },
    LoadFailed(LoadError),
    BindFailed(HeapError),
    Started(SlotId, TaskHandle),
    PriorityClamped { requested: u8, granted: u8 },
    TaskCreated(SlotId, TaskHandle),
    TaskLimit(SlotId),
    Suspended(SlotId),
    Resumed(SlotId),
    Exited(SlotId),
    DeleteTimeout(TaskHandle),
    AutoResumed(SlotId),
    SwapRejected,
    Restored(SlotId),
    RestoreFailed(LoadError),
    OutOfMemory { region: RegionId, size: usize },
    HooksRegistered(SlotId),
    IrqAttached(Vector, SlotId),
    IrqRejected(Vector),
    IrqDetached(Vector),
}
