// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! Sizing constants are generated by `build.rs` from `kconfig.toml`. The
//! handful of knobs that a board (or a test) needs to vary without rebuilding
//! live in [`KernelConfig`].

use static_assertions::const_assert;

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

const_assert!(BYTE_ALIGNMENT.is_power_of_two());
const_assert!(BYTE_ALIGNMENT >= core::mem::align_of::<usize>());
const_assert!(MAX_USER_APPS >= 1);
// Slot indices must fit the index bits of a `SlotId`.
const_assert!(MAX_USER_APPS <= abi::SlotId::INDEX_MASK as usize);
// Task ordinals 1..=MAX_USER_TASKS must stay inside a slot's number band.
const_assert!(MAX_USER_TASKS < abi::USER_TASK_BASE_ID as usize);
const_assert!(USER_HEAP_GUARD < USER_RAM_END);
const_assert!(APP_PRIORITY < MAX_PRIORITIES);

/// What happens to interrupt bindings owned by an application when it exits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqExitPolicy {
    /// Detach every vector the application owned.
    Release,
    /// Leave the bindings in place. The dispatcher will never forward to them
    /// again, because the owner's slot id is stale, but directly-attached
    /// vectors stay live in hardware.
    Retain,
}

#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    /// First address past the usable user RAM window.
    pub user_ram_end: usize,
    /// Bytes left untouched between an image's heap start and its heap.
    pub user_heap_guard: usize,
    pub irq_exit_policy: IrqExitPolicy,
    /// Number of scheduler priority levels.
    pub max_priorities: u8,
    pub app_stack_depth: usize,
    pub app_priority: u8,
    pub delete_timeout_ticks: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_ram_end: USER_RAM_END,
            user_heap_guard: USER_HEAP_GUARD,
            irq_exit_policy: IrqExitPolicy::Release,
            max_priorities: MAX_PRIORITIES,
            app_stack_depth: APP_STACK_DEPTH,
            app_priority: APP_PRIORITY,
            delete_timeout_ticks: DELETE_TIMEOUT_TICKS,
        }
    }
}
