// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-ins for the scheduler, the image loader and the interrupt
//! controller, so that the kernel can run under `cargo test`.
//!
//! Enabled for this crate's tests and, through the `fake` feature, for
//! dependents' tests.

use std::ptr::NonNull;

use abi::{
    app_name, AppProperties, EntryPoint, Priority, TaskHandle, TaskNumber,
    Vector,
};

use crate::config::{KernelConfig, KERNEL_HEAP_SIZE, USER_RAM_END};
use crate::err::{IrqError, LoadError, SchedError};
use crate::heap::{HeapManager, Region, TaskMemory, UserRam};
use crate::irq::{Handler, IrqHardware};
use crate::lifecycle::Kernel;
use crate::loader::Loader;
use crate::sched::{Scheduler, TaskSpec};

/// A kernel assembled entirely from fakes.
pub type TestKernel = Kernel<FakeScheduler, FakeLoader, FakeIrq>;

fn leak(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// A heap manager over leaked host memory, sized as configured.
pub fn heap_manager() -> HeapManager {
    heap_manager_with(KernelConfig::default())
}

pub fn heap_manager_with(config: KernelConfig) -> HeapManager {
    let kernel = Region::from_static(leak(KERNEL_HEAP_SIZE))
        .expect("kernel heap too small");
    HeapManager::new(kernel, UserRam::from_static(leak(USER_RAM_END)), config)
}

pub fn kernel(loader: FakeLoader) -> TestKernel {
    kernel_with(loader, KernelConfig::default())
}

pub fn kernel_with(loader: FakeLoader, config: KernelConfig) -> TestKernel {
    Kernel::new(
        FakeScheduler::default(),
        loader,
        FakeIrq::default(),
        heap_manager_with(config),
        config,
    )
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedEvent {
    Created(TaskHandle, TaskNumber),
    Suspended(TaskHandle),
    Resumed(TaskHandle),
    Deleted(TaskHandle),
    SuspendAll,
    ResumeAll,
}

#[derive(Clone, Debug)]
pub struct FakeTask {
    pub handle: TaskHandle,
    pub number: TaskNumber,
    pub name: String,
    pub entry: EntryPoint,
    pub priority: Priority,
    pub stack_words: usize,
    pub suspended: bool,
    stack: NonNull<u8>,
}

/// Records what the kernel asks of it. Task stacks are really allocated from
/// the memory the kernel hands over, and freed on deletion.
#[derive(Default)]
pub struct FakeScheduler {
    issued: u32,
    tasks: Vec<FakeTask>,
    events: Vec<SchedEvent>,
    current: TaskNumber,
    stuck: Vec<TaskHandle>,
    lock_depth: u32,
}

impl FakeScheduler {
    pub fn events(&self) -> &[SchedEvent] {
        &self.events
    }

    pub fn task(&self, handle: TaskHandle) -> Option<&FakeTask> {
        self.tasks.iter().find(|t| t.handle == handle)
    }

    pub fn number_of(&self, handle: TaskHandle) -> Option<TaskNumber> {
        self.task(handle).map(|t| t.number)
    }

    pub fn is_suspended(&self, handle: TaskHandle) -> bool {
        self.task(handle).is_some_and(|t| t.suspended)
    }

    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn set_current(&mut self, number: TaskNumber) {
        self.current = number;
    }

    /// Makes deletion of `handle` never get confirmed.
    pub fn stick_deletion(&mut self, handle: TaskHandle) {
        self.stuck.push(handle);
    }

    pub fn lock_depth(&self) -> u32 {
        self.lock_depth
    }

    fn with_task(&mut self, handle: TaskHandle, f: impl FnOnce(&mut FakeTask)) {
        if let Some(t) = self.tasks.iter_mut().find(|t| t.handle == handle) {
            f(t);
        }
    }
}

impl Scheduler for FakeScheduler {
    fn create_task(
        &mut self,
        spec: &TaskSpec<'_>,
        mem: &mut dyn TaskMemory,
    ) -> Result<TaskHandle, SchedError> {
        let stack = mem
            .allocate(spec.stack_words * 4)
            .map_err(|_| SchedError::OutOfMemory)?;
        self.issued += 1;
        let handle = TaskHandle(self.issued);
        self.tasks.push(FakeTask {
            handle,
            number: spec.number,
            name: spec.name.to_string(),
            entry: spec.entry,
            priority: spec.priority,
            stack_words: spec.stack_words,
            suspended: false,
            stack,
        });
        self.events.push(SchedEvent::Created(handle, spec.number));
        Ok(handle)
    }

    fn suspend(&mut self, task: TaskHandle) {
        self.with_task(task, |t| t.suspended = true);
        self.events.push(SchedEvent::Suspended(task));
    }

    fn resume(&mut self, task: TaskHandle) {
        self.with_task(task, |t| t.suspended = false);
        self.events.push(SchedEvent::Resumed(task));
    }

    fn delete_task(&mut self, task: TaskHandle, mem: &mut dyn TaskMemory) {
        if let Some(i) = self.tasks.iter().position(|t| t.handle == task) {
            let t = self.tasks.remove(i);
            mem.free(t.stack);
        }
        self.events.push(SchedEvent::Deleted(task));
    }

    fn await_deletion(
        &mut self,
        task: TaskHandle,
        _timeout_ticks: u32,
    ) -> Result<(), SchedError> {
        if self.stuck.contains(&task) {
            Err(SchedError::Timeout)
        } else {
            Ok(())
        }
    }

    fn current_task_number(&self) -> TaskNumber {
        self.current
    }

    fn suspend_all(&mut self) {
        self.lock_depth += 1;
        self.events.push(SchedEvent::SuspendAll);
    }

    fn resume_all(&mut self) {
        self.lock_depth = self.lock_depth.saturating_sub(1);
        self.events.push(SchedEvent::ResumeAll);
    }
}

/// An SD card's worth of images, by file name.
#[derive(Default)]
pub struct FakeLoader {
    images: Vec<(String, AppProperties)>,
    loads: Vec<String>,
    restages: Vec<String>,
}

impl FakeLoader {
    pub fn with_image(
        mut self,
        file: &str,
        entry: u32,
        heap_start: usize,
        heap_size: Option<usize>,
    ) -> Self {
        let props = AppProperties {
            name: app_name(file.trim_end_matches(".app")),
            version: 1,
            hash: 0,
            entry_point: EntryPoint(entry),
            heap_start,
            heap_size,
        };
        self.images.push((file.to_string(), props));
        self
    }

    /// Takes an image off the card.
    pub fn remove(&mut self, file: &str) {
        self.images.retain(|(n, _)| n != file);
    }

    /// Every name a full load was attempted for, in order.
    pub fn loads(&self) -> &[String] {
        &self.loads
    }

    pub fn restages(&self) -> &[String] {
        &self.restages
    }

    fn lookup(&self, file: &str) -> Result<&AppProperties, LoadError> {
        self.images
            .iter()
            .find(|(n, _)| n == file)
            .map(|(_, p)| p)
            .ok_or(LoadError::NotFound)
    }
}

impl Loader for FakeLoader {
    fn load_image(&mut self, name: &str) -> Result<AppProperties, LoadError> {
        self.loads.push(name.to_string());
        self.lookup(name).cloned()
    }

    fn restage_image(&mut self, name: &str) -> Result<(), LoadError> {
        self.restages.push(name.to_string());
        self.lookup(name).map(drop)
    }
}

/// A vector table and mask register.
#[derive(Default)]
pub struct FakeIrq {
    handlers: [Option<Handler>; Vector::COUNT],
    masked: [bool; Vector::COUNT],
    detached: Vec<Vector>,
    rejecting: Vec<Vector>,
}

impl FakeIrq {
    pub fn handler(&self, vector: Vector) -> Option<Handler> {
        self.handlers[vector.index()]
    }

    /// Every vector detached so far, in order.
    pub fn detached(&self) -> &[Vector] {
        &self.detached
    }

    pub fn is_masked(&self, vector: Vector) -> bool {
        self.masked[vector.index()]
    }

    /// Makes attaching `vector` fail.
    pub fn reject(&mut self, vector: Vector) {
        self.rejecting.push(vector);
    }
}

impl IrqHardware for FakeIrq {
    fn attach(
        &mut self,
        vector: Vector,
        _priority: u8,
        handler: Handler,
    ) -> Result<(), IrqError> {
        if self.rejecting.contains(&vector) {
            return Err(IrqError::Rejected);
        }
        self.handlers[vector.index()] = Some(handler);
        self.masked[vector.index()] = false;
        Ok(())
    }

    fn detach(&mut self, vector: Vector) {
        self.handlers[vector.index()] = None;
        self.detached.push(vector);
    }

    fn set_masked(&mut self, vector: Vector, masked: bool) {
        self.masked[vector.index()] = masked;
    }
}
