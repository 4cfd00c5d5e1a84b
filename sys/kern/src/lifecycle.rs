// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application lifecycle: load, suspend, resume, swap and exit.
//!
//! A slot moves `Empty -> Running -> PreSuspend -> Suspended -> PreResume ->
//! Running`, and back to `Empty` on exit. Every transition runs inside a
//! critical section with the scheduler's task switching suspended, so no task
//! (and no interrupt handler) ever sees a half-moved application.
//!
//! The controller owns the notion of the *current* application. It is passed
//! explicitly to heap routing and interrupt dispatch rather than living in a
//! global.

use core::ptr::NonNull;

use abi::{
    app_name, EntryPoint, Priority, SlotId, TaskHandle, TaskNumber, Vector,
};
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::config::{IrqExitPolicy, KernelConfig, MAX_USER_TASKS};
use crate::err::{HeapError, IrqError, LifecycleError, RegistryError};
use crate::heap::{HeapManager, RegionId, RoutedHeap};
use crate::irq::{IrqHardware, IsrFn, Router};
use crate::loader::Loader;
use crate::registry::{Hook, HookContext, Registry, SlotState};
use crate::sched::Scheduler;
use crate::trace::{Trace, TRACE_DEPTH};

type Handles = heapless::Vec<TaskHandle, MAX_USER_TASKS>;

/// Treats a deletion timeout as success; the cleanup it reports has already
/// happened.
fn tolerate_timeout(
    r: Result<(), LifecycleError>,
) -> Result<(), LifecycleError> {
    match r {
        Err(LifecycleError::DeleteTimeout) => Ok(()),
        r => r,
    }
}

pub struct Kernel<S, L, H> {
    sched: S,
    loader: L,
    irq_hw: H,
    heap: HeapManager,
    registry: Registry,
    router: Router,
    current: Option<SlotId>,
    config: KernelConfig,
    trace: Ringbuf<Trace, TRACE_DEPTH>,
}

impl<S: Scheduler, L: Loader, H: IrqHardware> Kernel<S, L, H> {
    pub fn new(
        sched: S,
        loader: L,
        irq_hw: H,
        heap: HeapManager,
        config: KernelConfig,
    ) -> Self {
        Self {
            sched,
            loader,
            irq_hw,
            heap,
            registry: Registry::new(),
            router: Router::new(),
            current: None,
            config,
            trace: Ringbuf::new(Trace::None),
        }
    }

    fn transition<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        critical_section::with(|_| {
            self.sched.suspend_all();
            let r = f(self);
            self.sched.resume_all();
            r
        })
    }

    fn default_main(&self) -> (Priority, usize) {
        (
            Priority(self.config.app_priority),
            self.config.app_stack_depth,
        )
    }

    fn handles(&self, slot: SlotId) -> Result<(Option<TaskHandle>, Handles), RegistryError> {
        let s = self.registry.slot(slot)?;
        Ok((s.main(), s.tasks().iter().copied().collect()))
    }

    fn run_hook(&mut self, slot: SlotId, hook: Option<Hook>) {
        if let Some(hook) = hook {
            let task = self.sched.current_task_number();
            hook(&mut HookContext::new(slot, task, &mut self.heap));
        }
    }

    /// Loads `name` and starts its main task with the default priority and
    /// stack depth.
    pub fn load(&mut self, name: &str) -> Result<SlotId, LifecycleError> {
        let (priority, stack_words) = self.default_main();
        self.load_with(name, priority, stack_words)
    }

    /// Loads `name` and starts its main task.
    ///
    /// Whatever application is current is exited first, and so is any older
    /// instance of `name`. If the image cannot be loaded, no application is
    /// left current.
    pub fn load_with(
        &mut self,
        name: &str,
        priority: Priority,
        stack_words: usize,
    ) -> Result<SlotId, LifecycleError> {
        self.transition(|k| k.load_locked(name, priority, stack_words))
    }

    fn load_locked(
        &mut self,
        name: &str,
        priority: Priority,
        stack_words: usize,
    ) -> Result<SlotId, LifecycleError> {
        if let Some(cur) = self.current {
            tolerate_timeout(self.exit_slot(cur))?;
        }
        let mut slot = self.registry.find_or_allocate_slot(name)?;
        if self.registry.slot(slot)?.state().is_occupied() {
            tolerate_timeout(self.exit_slot(slot))?;
            slot = self.registry.find_or_allocate_slot(name)?;
        }
        self.load_into(slot, name, priority, stack_words)
    }

    /// Loads `name` into the reserved `slot` and starts it.
    fn load_into(
        &mut self,
        slot: SlotId,
        name: &str,
        priority: Priority,
        stack_words: usize,
    ) -> Result<SlotId, LifecycleError> {
        let props = match self.loader.load_image(name) {
            Ok(p) => p,
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::LoadFailed(e));
                self.registry.release_reservation(slot);
                return Err(e.into());
            }
        };
        let task = self.sched.current_task_number();
        let region = match self
            .heap
            .bind(slot, props.heap_start, props.heap_size)
            .and_then(|()| self.heap.route(task, Some(slot)))
        {
            Ok(region) => region,
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::BindFailed(e));
                self.heap.release(slot);
                self.registry.release_reservation(slot);
                return Err(e.into());
            }
        };

        let granted = priority.clamp_to(self.config.max_priorities);
        if granted != priority {
            ringbuf_entry!(
                self.trace,
                Trace::PriorityClamped {
                    requested: priority.0,
                    granted: granted.0,
                }
            );
        }

        let entry = props.entry_point;
        let heap_start = props.heap_start;
        self.registry.set_image(slot, props)?;
        self.current = Some(slot);

        let started = self.registry.start_main(
            &mut self.sched,
            &mut RoutedHeap::new(&mut self.heap, region),
            slot,
            entry,
            stack_words,
            granted,
        );

        match started {
            Ok(main) => {
                ringbuf_entry!(
                    self.trace,
                    Trace::Loaded {
                        slot,
                        entry,
                        heap_start,
                    }
                );
                ringbuf_entry!(self.trace, Trace::Started(slot, main));
                Ok(slot)
            }
            Err(e) => {
                self.heap.release(slot);
                self.registry.release_reservation(slot);
                self.current = None;
                Err(e.into())
            }
        }
    }

    /// Suspends an application's tasks. Suspending a suspended application
    /// does nothing.
    pub fn suspend(&mut self, slot: SlotId) -> Result<(), LifecycleError> {
        self.transition(|k| k.suspend_locked(slot))
    }

    fn suspend_locked(&mut self, slot: SlotId) -> Result<(), LifecycleError> {
        match self.registry.slot(slot)?.state() {
            SlotState::Empty | SlotState::Reserved => {
                return Err(LifecycleError::NotFound)
            }
            SlotState::PreSuspend | SlotState::Suspended => return Ok(()),
            SlotState::Running | SlotState::PreResume => {}
        }

        self.current = Some(slot);
        self.heap.rebind(slot)?;
        self.registry.set_state(slot, SlotState::PreSuspend)?;
        let hooks = self.registry.slot(slot)?.hooks();
        self.run_hook(slot, hooks.pre_suspend);

        let (main, tasks) = self.handles(slot)?;
        for t in main.into_iter().chain(tasks) {
            self.sched.suspend(t);
        }
        self.router.set_slot_masked(&mut self.irq_hw, slot, true);

        self.registry.set_state(slot, SlotState::Suspended)?;
        ringbuf_entry!(self.trace, Trace::Suspended(slot));
        Ok(())
    }

    /// Resumes a suspended application. Resuming a running application does
    /// nothing, and does not run its hook.
    pub fn resume(&mut self, slot: SlotId) -> Result<(), LifecycleError> {
        self.transition(|k| k.resume_locked(slot))
    }

    fn resume_locked(&mut self, slot: SlotId) -> Result<(), LifecycleError> {
        match self.registry.slot(slot)?.state() {
            SlotState::Empty | SlotState::Reserved => {
                return Err(LifecycleError::NotFound)
            }
            SlotState::Running | SlotState::PreResume => {
                self.current = Some(slot);
                self.heap.rebind(slot)?;
                return Ok(());
            }
            SlotState::PreSuspend | SlotState::Suspended => {}
        }

        self.current = Some(slot);
        self.heap.rebind(slot)?;
        self.registry.set_state(slot, SlotState::PreResume)?;

        let (main, tasks) = self.handles(slot)?;
        for t in tasks.iter().rev().copied().chain(main) {
            self.sched.resume(t);
        }
        self.router.set_slot_masked(&mut self.irq_hw, slot, false);

        let hooks = self.registry.slot(slot)?.hooks();
        self.run_hook(slot, hooks.post_resume);

        self.registry.set_state(slot, SlotState::Running)?;
        ringbuf_entry!(self.trace, Trace::Resumed(slot));
        Ok(())
    }

    /// Tears an application down. Exiting an empty slot does nothing, and
    /// neither does exiting an id whose application has already gone.
    ///
    /// If the application was current, the next occupied slot (scanning
    /// forward and wrapping) becomes current and is resumed.
    ///
    /// `DeleteTimeout` means the slot was cleared but the scheduler did not
    /// confirm every task deletion in time.
    pub fn exit(&mut self, slot: SlotId) -> Result<(), LifecycleError> {
        self.transition(|k| {
            let was_current = k.current == Some(slot);
            let result = match k.exit_slot(slot) {
                Err(LifecycleError::StaleSlot) => return Ok(()),
                r => r,
            };
            if was_current && k.current.is_none() {
                k.resume_next(slot.index());
            }
            result
        })
    }

    /// Exits the current application; see [`Kernel::exit`].
    pub fn kill_current(&mut self) -> Result<SlotId, LifecycleError> {
        let slot = self.current.ok_or(LifecycleError::NotFound)?;
        self.exit(slot).map(|()| slot)
    }

    fn resume_next(&mut self, after: usize) {
        if let Some(next) = self.registry.next_occupied_after(after) {
            ringbuf_entry!(self.trace, Trace::AutoResumed(next));
            // The slot was just found occupied, so this cannot fail.
            let _ = self.resume_locked(next);
        }
    }

    fn exit_slot(&mut self, slot: SlotId) -> Result<(), LifecycleError> {
        match self.registry.slot(slot)?.state() {
            SlotState::Empty => return Ok(()),
            SlotState::Reserved => {
                self.registry.release_reservation(slot);
                return Ok(());
            }
            _ => {}
        }
        let hooks = self.registry.slot(slot)?.hooks();
        let (main, tasks) = self.handles(slot)?;

        self.run_hook(slot, hooks.pre_suspend);
        self.registry.clear_hooks(slot);

        let mut timed_out = false;
        for t in main.into_iter().chain(tasks) {
            self.sched.delete_task(
                t,
                &mut RoutedHeap::new(&mut self.heap, RegionId::User(slot)),
            );
            if self
                .sched
                .await_deletion(t, self.config.delete_timeout_ticks)
                .is_err()
            {
                ringbuf_entry!(self.trace, Trace::DeleteTimeout(t));
                timed_out = true;
            }
        }

        if self.config.irq_exit_policy == IrqExitPolicy::Release {
            self.router.release_slot(&mut self.irq_hw, slot);
        }
        self.heap.release(slot);
        self.registry.clear(slot)?;
        if self.current == Some(slot) {
            self.current = None;
        }
        ringbuf_entry!(self.trace, Trace::Exited(slot));

        if timed_out {
            Err(LifecycleError::DeleteTimeout)
        } else {
            Ok(())
        }
    }

    /// Switches to `name`: the current application is suspended, and `name`
    /// is resumed if it is already loaded or loaded fresh if not.
    ///
    /// If every slot is taken, nothing is suspended. If a fresh load fails,
    /// the previous application is re-staged and resumed.
    pub fn swap(&mut self, name: &str) -> Result<SlotId, LifecycleError> {
        let (priority, stack_words) = self.default_main();
        self.transition(|k| k.swap_locked(name, priority, stack_words))
    }

    fn swap_locked(
        &mut self,
        name: &str,
        priority: Priority,
        stack_words: usize,
    ) -> Result<SlotId, LifecycleError> {
        let Some(prev) = self.current else {
            return self.load_locked(name, priority, stack_words);
        };
        if self.registry.slot(prev)?.name() == app_name(name).as_str() {
            self.resume_locked(prev)?;
            return Ok(prev);
        }

        let target = match self.registry.find_or_allocate_slot(name) {
            Ok(t) => t,
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::SwapRejected);
                return Err(e.into());
            }
        };
        if let Err(e) = self.suspend_locked(prev) {
            self.registry.release_reservation(target);
            return Err(e);
        }

        if self.registry.slot(target)?.state().is_occupied() {
            self.resume_locked(target)?;
            return Ok(target);
        }

        match self.load_into(target, name, priority, stack_words) {
            Ok(slot) => Ok(slot),
            Err(e) => {
                let prev_name = app_name(self.registry.slot(prev)?.name());
                match self.loader.restage_image(&prev_name) {
                    Ok(()) => ringbuf_entry!(self.trace, Trace::Restored(prev)),
                    Err(le) => {
                        ringbuf_entry!(self.trace, Trace::RestoreFailed(le))
                    }
                }
                self.resume_locked(prev)?;
                Err(e)
            }
        }
    }

    /// Creates a subordinate task for an application, with its stack taken
    /// from the application's user region.
    pub fn create_task(
        &mut self,
        slot: SlotId,
        entry: EntryPoint,
        name: &str,
        stack_words: usize,
        priority: Priority,
    ) -> Result<TaskHandle, LifecycleError> {
        critical_section::with(|_| {
            let granted = priority.clamp_to(self.config.max_priorities);
            self.registry.slot(slot)?;
            let region =
                self.heap.route(self.sched.current_task_number(), Some(slot))?;
            let r = self.registry.create_task(
                &mut self.sched,
                &mut RoutedHeap::new(&mut self.heap, region),
                slot,
                entry,
                name,
                stack_words,
                granted,
            );
            match r {
                Ok(t) => {
                    ringbuf_entry!(self.trace, Trace::TaskCreated(slot, t))
                }
                Err(RegistryError::ResourceExhausted) => {
                    ringbuf_entry!(self.trace, Trace::TaskLimit(slot))
                }
                Err(_) => {}
            }
            Ok(r?)
        })
    }

    pub fn register_hooks(
        &mut self,
        slot: SlotId,
        pre_suspend: Option<Hook>,
        post_resume: Option<Hook>,
    ) -> Result<(), LifecycleError> {
        critical_section::with(|_| {
            self.registry
                .register_hooks(slot, pre_suspend, post_resume)?;
            ringbuf_entry!(self.trace, Trace::HooksRegistered(slot));
            Ok(())
        })
    }

    /// Gives `slot` ownership of `vector`. A vector owned by another live
    /// application is refused.
    pub fn attach_irq(
        &mut self,
        slot: SlotId,
        vector: Vector,
        priority: u8,
        isr: IsrFn,
    ) -> Result<(), LifecycleError> {
        critical_section::with(|_| {
            if !self.registry.slot(slot)?.state().is_occupied() {
                return Err(LifecycleError::NotFound);
            }
            let taken = self.router.binding(vector).is_some_and(|b| {
                b.owner != slot
                    && self
                        .registry
                        .slot(b.owner)
                        .is_ok_and(|s| s.state().is_occupied())
            });
            let r = if taken {
                Err(IrqError::Rejected)
            } else {
                self.router
                    .attach(&mut self.irq_hw, slot, vector, priority, isr)
            };
            if r.is_ok() {
                ringbuf_entry!(self.trace, Trace::IrqAttached(vector, slot));
            } else {
                ringbuf_entry!(self.trace, Trace::IrqRejected(vector));
            }
            Ok(r?)
        })
    }

    pub fn detach_irq(&mut self, vector: Vector) {
        critical_section::with(|_| {
            self.router.detach(&mut self.irq_hw, vector);
            ringbuf_entry!(self.trace, Trace::IrqDetached(vector));
        })
    }

    /// Kernel dispatcher entry for routed vectors. Returns whether the current
    /// application's handler ran. A suspended application gets nothing, even
    /// while it is still current.
    pub fn dispatch_irq(&self, vector: Vector) -> bool {
        let live = self.current.filter(|&slot| {
            self.registry
                .slot(slot)
                .is_ok_and(|s| s.state() == SlotState::Running)
        });
        self.router.dispatch(vector, live)
    }

    /// Scheduler tick hook: forwards the timer to its owner while the owner
    /// is current and running.
    pub fn tick(&self) -> bool {
        self.dispatch_irq(Vector::Timers)
    }

    /// Allocates for the running task, from its application's user region or
    /// from the kernel region.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        critical_section::with(|_| {
            let region = self
                .heap
                .route(self.sched.current_task_number(), None)?;
            let r = self.heap.allocate(region, size);
            if r == Err(HeapError::OutOfMemory) {
                ringbuf_entry!(self.trace, Trace::OutOfMemory { region, size });
            }
            r
        })
    }

    /// Frees to whichever region `ptr` came from.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        critical_section::with(|_| self.heap.free_by_address(ptr))
    }

    pub fn current(&self) -> Option<SlotId> {
        self.current
    }

    pub fn slot_state(&self, slot: SlotId) -> Result<SlotState, LifecycleError> {
        Ok(self.registry.slot(slot)?.state())
    }

    pub fn find(&self, name: &str) -> Option<SlotId> {
        self.registry.find(name)
    }

    pub fn main_handle(&self, slot: SlotId) -> Option<TaskHandle> {
        self.registry.main_handle(slot)
    }

    /// The application the running task belongs to, if any.
    pub fn running_slot(&self) -> Option<SlotId> {
        self.registry
            .slot_for_task_number(self.sched.current_task_number())
    }

    pub fn slot_for_task_number(&self, n: TaskNumber) -> Option<SlotId> {
        self.registry.slot_for_task_number(n)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn heap(&self) -> &HeapManager {
        &self.heap
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_DEPTH> {
        &self.trace
    }

    pub fn scheduler(&self) -> &S {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.sched
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn irq_hardware(&self) -> &H {
        &self.irq_hw
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_USER_APPS;
    use crate::err::LoadError;
    use crate::fake::{self, FakeLoader, SchedEvent, TestKernel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn two_apps() -> FakeLoader {
        FakeLoader::default()
            .with_image("A.app", 0x10_0000, 0x1000, Some(0x3000))
            .with_image("B.app", 0x20_0000, 0x5000, Some(0x3000))
    }

    fn state_at(k: &TestKernel, index: usize) -> SlotState {
        k.registry().slots().nth(index).unwrap().state()
    }

    #[test]
    fn load_swap_swap_exit() {
        let mut k = fake::kernel(two_apps());

        let a = k.load("A.app").unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(k.slot_state(a), Ok(SlotState::Running));
        assert_eq!(k.current(), Some(a));

        let b = k.swap("B.app").unwrap();
        assert_eq!(b.index(), 1);
        assert_eq!(k.slot_state(b), Ok(SlotState::Running));
        assert_eq!(k.slot_state(a), Ok(SlotState::Suspended));
        assert_eq!(k.loader().loads().len(), 2);

        assert_eq!(k.swap("A.app"), Ok(a));
        assert_eq!(k.slot_state(a), Ok(SlotState::Running));
        assert_eq!(k.slot_state(b), Ok(SlotState::Suspended));
        assert_eq!(k.loader().loads().len(), 2);
        assert_eq!(k.current(), Some(a));

        k.exit(a).unwrap();
        assert_eq!(state_at(&k, 0), SlotState::Empty);
        assert_eq!(k.slot_state(a), Err(LifecycleError::StaleSlot));
        assert_eq!(k.slot_state(b), Ok(SlotState::Running));
        assert_eq!(k.current(), Some(b));
        assert!(k.trace().contains(&Trace::AutoResumed(b)));
    }

    #[test]
    fn transitions_hold_the_scheduler() {
        let mut k = fake::kernel(two_apps());
        k.load("A.app").unwrap();
        k.swap("B.app").unwrap();
        let ev = k.scheduler().events();
        let holds = ev.iter().filter(|e| **e == SchedEvent::SuspendAll).count();
        let releases =
            ev.iter().filter(|e| **e == SchedEvent::ResumeAll).count();
        assert_eq!(holds, 2);
        assert_eq!(releases, 2);
        assert_eq!(k.scheduler().lock_depth(), 0);
    }

    static PRE: AtomicUsize = AtomicUsize::new(0);
    static POST: AtomicUsize = AtomicUsize::new(0);

    fn pre(cx: &mut HookContext<'_>) {
        PRE.fetch_add(1, Ordering::SeqCst);
        // Hooks allocate from their own region.
        let p = cx.allocate(16).unwrap();
        cx.free(p);
    }

    fn post(_: &mut HookContext<'_>) {
        POST.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn suspend_and_resume_are_idempotent() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        let worker = k
            .create_task(a, EntryPoint(0x10_0100), "worker", 64, Priority(2))
            .unwrap();
        let main = k.main_handle(a).unwrap();
        k.register_hooks(a, Some(pre), Some(post)).unwrap();

        k.resume(a).unwrap();
        assert_eq!(POST.load(Ordering::SeqCst), 0);

        k.suspend(a).unwrap();
        k.suspend(a).unwrap();
        assert_eq!(PRE.load(Ordering::SeqCst), 1);
        assert!(k.scheduler().is_suspended(main));
        assert!(k.scheduler().is_suspended(worker));
        let suspends = k
            .scheduler()
            .events()
            .iter()
            .filter(|e| matches!(e, SchedEvent::Suspended(_)))
            .count();
        assert_eq!(suspends, 2);

        k.resume(a).unwrap();
        k.resume(a).unwrap();
        assert_eq!(POST.load(Ordering::SeqCst), 1);
        assert!(!k.scheduler().is_suspended(main));
        assert!(!k.scheduler().is_suspended(worker));

        // Subordinates come back before the main task.
        let resumed: Vec<_> = k
            .scheduler()
            .events()
            .iter()
            .filter_map(|e| match e {
                SchedEvent::Resumed(t) => Some(*t),
                _ => None,
            })
            .collect();
        assert_eq!(resumed, vec![worker, main]);
    }

    #[test]
    fn load_failure_leaves_nothing_current() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        assert_eq!(
            k.load("missing.app"),
            Err(LifecycleError::LoadFailure(LoadError::NotFound))
        );
        assert_eq!(k.current(), None);
        assert_eq!(k.slot_state(a), Err(LifecycleError::StaleSlot));
        assert_eq!(k.find("missing.app"), None);
        assert!(k
            .trace()
            .contains(&Trace::LoadFailed(LoadError::NotFound)));
        assert_eq!(k.scheduler().live_tasks(), 0);
    }

    #[test]
    fn reloading_a_loaded_app_starts_fresh() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        let a2 = k.load("A.app").unwrap();
        assert_eq!(a2.index(), a.index());
        assert_ne!(a2, a);
        assert_eq!(k.loader().loads().len(), 2);
        assert_eq!(k.scheduler().live_tasks(), 1);
    }

    #[test]
    fn swap_failure_restores_previous() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        assert_eq!(
            k.swap("missing.app"),
            Err(LifecycleError::LoadFailure(LoadError::NotFound))
        );
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.slot_state(a), Ok(SlotState::Running));
        assert_eq!(k.loader().restages(), &["A.app".to_string()]);
        assert_eq!(k.find("missing.app"), None);
        assert!(k.trace().contains(&Trace::Restored(a)));
    }

    #[test]
    fn previous_app_resumes_even_if_restage_fails() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.loader_mut().remove("A.app");
        assert!(k.swap("B.app").is_ok());
        k.loader_mut().remove("B.app");
        assert!(k.swap("missing.app").is_err());
        let b = k.find("B.app").unwrap();
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.slot_state(b), Ok(SlotState::Running));
        assert_eq!(k.slot_state(a), Ok(SlotState::Suspended));
        assert!(k
            .trace()
            .contains(&Trace::RestoreFailed(LoadError::NotFound)));
    }

    #[test]
    fn swap_with_full_table_suspends_nothing() {
        let mut loader = FakeLoader::default();
        let names: Vec<String> =
            (0..=MAX_USER_APPS).map(|i| format!("app{i}.app")).collect();
        for (i, n) in names.iter().enumerate() {
            loader = loader.with_image(n, 0, 0x1000 + i * 0x2000, Some(0x1800));
        }
        let mut k = fake::kernel(loader);
        k.load(&names[0]).unwrap();
        for n in &names[1..MAX_USER_APPS] {
            k.swap(n).unwrap();
        }
        let last = k.current().unwrap();

        assert_eq!(
            k.swap(&names[MAX_USER_APPS]),
            Err(LifecycleError::AllSlotsFull)
        );
        assert_eq!(k.current(), Some(last));
        assert_eq!(k.slot_state(last), Ok(SlotState::Running));
        assert!(k.trace().contains(&Trace::SwapRejected));
    }

    #[test]
    fn swap_without_current_app_loads() {
        let mut k = fake::kernel(two_apps());
        let b = k.swap("B.app").unwrap();
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.slot_state(b), Ok(SlotState::Running));
        // Swapping to the current app is a no-op.
        assert_eq!(k.swap("B.app"), Ok(b));
        assert_eq!(k.loader().loads().len(), 1);
    }

    #[test]
    fn task_limit_is_enforced() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        let before = k.heap().free_bytes(RegionId::User(a));
        for _ in 0..MAX_USER_TASKS {
            k.create_task(a, EntryPoint(0), "t", 16, Priority(1)).unwrap();
        }
        assert!(k.heap().free_bytes(RegionId::User(a)) < before);
        let live = k.scheduler().live_tasks();
        assert_eq!(
            k.create_task(a, EntryPoint(0), "t", 16, Priority(1)),
            Err(LifecycleError::ResourceExhausted)
        );
        assert_eq!(k.scheduler().live_tasks(), live);
        assert!(k.trace().contains(&Trace::TaskLimit(a)));
    }

    #[test]
    fn main_task_priority_is_clamped() {
        let mut k = fake::kernel(two_apps());
        let a = k.load_with("A.app", Priority(200), 64).unwrap();
        let main = k.main_handle(a).unwrap();
        let max = k.config().max_priorities;
        assert_eq!(
            k.scheduler().task(main).unwrap().priority,
            Priority(max - 2)
        );
    }

    #[test]
    fn malloc_routes_by_running_task() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();

        k.scheduler_mut().set_current(TaskNumber::for_slot(a.index(), 1));
        let p = k.malloc(32).unwrap();
        assert_eq!(k.heap().region_of(p), Some(RegionId::User(a)));
        assert_eq!(k.running_slot(), Some(a));

        k.scheduler_mut().set_current(TaskNumber::kernel(1));
        let q = k.malloc(32).unwrap();
        assert_eq!(k.heap().region_of(q), Some(RegionId::Kernel));

        k.free(p);
        k.free(q);
        assert_eq!(k.malloc(0), Err(HeapError::OutOfMemory));

        // Once B is current, A's tasks no longer reach any user region.
        let b = k.swap("B.app").unwrap();
        k.scheduler_mut().set_current(TaskNumber::for_slot(a.index(), 1));
        assert_eq!(k.malloc(32), Err(HeapError::NotBound));
        k.scheduler_mut().set_current(TaskNumber::for_slot(b.index(), 0));
        let r = k.malloc(32).unwrap();
        assert_eq!(k.heap().region_of(r), Some(RegionId::User(b)));
        k.free(r);
    }

    #[test]
    fn exit_frees_task_memory() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.create_task(a, EntryPoint(0), "t", 16, Priority(1)).unwrap();
        k.exit(a).unwrap();
        assert_eq!(k.scheduler().live_tasks(), 0);
        assert!(k.heap().region(RegionId::User(a)).is_none());
        assert_eq!(k.current(), None);
    }

    #[test]
    fn delete_timeout_still_clears_slot() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        let main = k.main_handle(a).unwrap();
        k.scheduler_mut().stick_deletion(main);
        assert_eq!(k.exit(a), Err(LifecycleError::DeleteTimeout));
        assert_eq!(state_at(&k, 0), SlotState::Empty);
        assert!(k.trace().contains(&Trace::DeleteTimeout(main)));
    }

    #[test]
    fn exiting_twice_does_nothing() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.exit(a).unwrap();
        assert_eq!(k.exit(a), Ok(()));
        assert_eq!(k.current(), None);
        assert_eq!(k.kill_current(), Err(LifecycleError::NotFound));

        // The old id must not touch whatever reuses the slot.
        let b = k.load("B.app").unwrap();
        assert_eq!(b.index(), a.index());
        assert_eq!(k.exit(a), Ok(()));
        assert_eq!(k.slot_state(b), Ok(SlotState::Running));
        assert_eq!(k.current(), Some(b));
    }

    static HOOK_ALLOC: AtomicUsize = AtomicUsize::new(0);

    fn record_alloc(cx: &mut HookContext<'_>) {
        let p = cx.allocate(24).unwrap();
        HOOK_ALLOC.store(p.as_ptr() as usize, Ordering::SeqCst);
        cx.free(p);
    }

    #[test]
    fn hooks_on_kernel_tasks_allocate_from_the_app() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.register_hooks(a, Some(record_alloc), None).unwrap();
        k.scheduler_mut().set_current(TaskNumber::kernel(3));

        k.suspend(a).unwrap();
        let addr = HOOK_ALLOC.load(Ordering::SeqCst);
        let p = NonNull::new(addr as *mut u8).unwrap();
        assert_eq!(k.heap().region_of(p), Some(RegionId::User(a)));
    }

    static TICKS: AtomicUsize = AtomicUsize::new(0);

    fn on_tick(_: Vector) {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }

    fn on_i2s(_: Vector) {}

    #[test]
    fn ticks_reach_only_the_current_owner() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.attach_irq(a, Vector::Timers, 0, on_tick).unwrap();
        assert!(k.tick());
        assert_eq!(TICKS.load(Ordering::SeqCst), 1);

        k.swap("B.app").unwrap();
        assert!(!k.tick());
        assert_eq!(TICKS.load(Ordering::SeqCst), 1);
        assert!(k.irq_hardware().handler(Vector::Timers).is_none());
    }

    static UART_HITS: AtomicUsize = AtomicUsize::new(0);
    static TIMER_HITS: AtomicUsize = AtomicUsize::new(0);

    fn on_uart(_: Vector) {
        UART_HITS.fetch_add(1, Ordering::SeqCst);
    }

    fn on_timer(_: Vector) {
        TIMER_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn suspended_app_gets_no_routed_interrupts() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.attach_irq(a, Vector::Uart0, 1, on_uart).unwrap();
        k.attach_irq(a, Vector::Timers, 0, on_timer).unwrap();

        k.suspend(a).unwrap();
        assert_eq!(k.current(), Some(a));
        assert!(!k.dispatch_irq(Vector::Uart0));
        assert!(!k.tick());
        assert_eq!(UART_HITS.load(Ordering::SeqCst), 0);
        assert_eq!(TIMER_HITS.load(Ordering::SeqCst), 0);

        k.resume(a).unwrap();
        assert!(k.dispatch_irq(Vector::Uart0));
        assert!(k.tick());
        assert_eq!(UART_HITS.load(Ordering::SeqCst), 1);
        assert_eq!(TIMER_HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn vectors_owned_by_live_apps_are_refused() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.attach_irq(a, Vector::Uart0, 1, on_i2s).unwrap();
        let b = k.swap("B.app").unwrap();
        assert_eq!(
            k.attach_irq(b, Vector::Uart0, 1, on_i2s),
            Err(LifecycleError::Irq(IrqError::Rejected))
        );
        k.detach_irq(Vector::Uart0);
        k.attach_irq(b, Vector::Uart0, 1, on_i2s).unwrap();
    }

    #[test]
    fn suspend_masks_direct_vectors() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.attach_irq(a, Vector::I2s, 1, on_i2s).unwrap();
        k.suspend(a).unwrap();
        assert!(k.irq_hardware().is_masked(Vector::I2s));
        k.resume(a).unwrap();
        assert!(!k.irq_hardware().is_masked(Vector::I2s));
    }

    #[test]
    fn exit_policy_release_detaches() {
        let mut k = fake::kernel(two_apps());
        let a = k.load("A.app").unwrap();
        k.attach_irq(a, Vector::I2s, 1, on_i2s).unwrap();
        k.exit(a).unwrap();
        assert!(k.irq_hardware().handler(Vector::I2s).is_none());
        assert_eq!(k.irq_hardware().detached(), &[Vector::I2s]);
    }

    #[test]
    fn exit_policy_retain_keeps_bindings_inert() {
        let config = KernelConfig {
            irq_exit_policy: IrqExitPolicy::Retain,
            ..KernelConfig::default()
        };
        let mut k = fake::kernel_with(two_apps(), config);
        let a = k.load("A.app").unwrap();
        k.attach_irq(a, Vector::Ethernet, 1, on_i2s).unwrap();
        k.exit(a).unwrap();
        assert!(k.irq_hardware().handler(Vector::Ethernet).is_some());
        assert!(!k.dispatch_irq(Vector::Ethernet));

        // A new application may take over the orphaned vector.
        let b = k.load("B.app").unwrap();
        k.attach_irq(b, Vector::Ethernet, 1, on_i2s).unwrap();
    }
}
