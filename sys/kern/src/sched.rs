// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The preemptive scheduler underneath the kernel, as seen from here.

use abi::{EntryPoint, Priority, TaskHandle, TaskNumber};

use crate::err::SchedError;
use crate::heap::TaskMemory;

/// Everything the scheduler needs to create one task.
#[derive(Copy, Clone, Debug)]
pub struct TaskSpec<'a> {
    pub entry: EntryPoint,
    pub name: &'a str,
    /// Stack depth in words.
    pub stack_words: usize,
    pub priority: Priority,
    /// Stamped on the task so that its owner can be recovered later.
    pub number: TaskNumber,
}

pub trait Scheduler {
    /// Creates a task, taking its stack and control block from `mem`.
    fn create_task(
        &mut self,
        spec: &TaskSpec<'_>,
        mem: &mut dyn TaskMemory,
    ) -> Result<TaskHandle, SchedError>;

    fn suspend(&mut self, task: TaskHandle);
    fn resume(&mut self, task: TaskHandle);

    /// Deletes a task, returning its stack and control block through `mem`.
    fn delete_task(&mut self, task: TaskHandle, mem: &mut dyn TaskMemory);

    /// Waits up to `timeout_ticks` for a deletion to be confirmed.
    fn await_deletion(
        &mut self,
        task: TaskHandle,
        timeout_ticks: u32,
    ) -> Result<(), SchedError>;

    /// Number of the task running right now.
    fn current_task_number(&self) -> TaskNumber;

    /// Stops the scheduler from switching tasks until `resume_all`.
    fn suspend_all(&mut self);
    fn resume_all(&mut self);
}
