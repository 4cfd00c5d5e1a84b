// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application slots and the scheduler tasks that belong to them.

use core::ptr::NonNull;

use abi::{
    app_name, AppName, AppProperties, EntryPoint, Generation, Priority, SlotId,
    TaskHandle, TaskNumber,
};

use crate::config::{MAX_USER_APPS, MAX_USER_TASKS};
use crate::err::{HeapError, RegistryError};
use crate::heap::{HeapManager, RegionId, TaskMemory};
use crate::sched::{Scheduler, TaskSpec};

/// Where a slot is in its lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    Empty,
    /// Claimed for an application whose image is being loaded.
    Reserved,
    Running,
    /// Pre-suspend hook running.
    PreSuspend,
    Suspended,
    /// Tasks resumed, post-resume hook not yet finished.
    PreResume,
}

impl SlotState {
    /// Holds a started application.
    pub fn is_occupied(self) -> bool {
        !matches!(self, SlotState::Empty | SlotState::Reserved)
    }
}

/// Hook run by the kernel on an application's behalf. Hooks run inside the
/// transition's critical section and must be quick.
pub type Hook = fn(&mut HookContext<'_>);

#[derive(Copy, Clone, Debug, Default)]
pub struct AppHooks {
    pub pre_suspend: Option<Hook>,
    pub post_resume: Option<Hook>,
}

/// What a hook may touch: allocations made here always come from the
/// application's own user region, whichever task the hook runs on.
pub struct HookContext<'a> {
    slot: SlotId,
    task: TaskNumber,
    heap: &'a mut HeapManager,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        slot: SlotId,
        task: TaskNumber,
        heap: &'a mut HeapManager,
    ) -> Self {
        Self { slot, task, heap }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The task the hook is running on, which may be a kernel task.
    pub fn task(&self) -> TaskNumber {
        self.task
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let region = self.heap.route(self.task, Some(self.slot))?;
        self.heap.allocate(region, size)
    }

    pub fn free(&mut self, ptr: NonNull<u8>) {
        self.heap.free(RegionId::User(self.slot), ptr)
    }
}

pub struct Slot {
    id: SlotId,
    state: SlotState,
    name: AppName,
    main: Option<TaskHandle>,
    /// Subordinate tasks, in creation order.
    tasks: heapless::Vec<TaskHandle, MAX_USER_TASKS>,
    hooks: AppHooks,
    image: Option<AppProperties>,
}

impl Slot {
    fn empty(id: SlotId) -> Self {
        Self {
            id,
            state: SlotState::Empty,
            name: AppName::new(),
            main: None,
            tasks: heapless::Vec::new(),
            hooks: AppHooks::default(),
            image: None,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main(&self) -> Option<TaskHandle> {
        self.main
    }

    pub fn tasks(&self) -> &[TaskHandle] {
        &self.tasks
    }

    pub fn hooks(&self) -> AppHooks {
        self.hooks
    }

    pub fn image(&self) -> Option<&AppProperties> {
        self.image.as_ref()
    }

    fn owns(&self, task: TaskHandle) -> bool {
        self.main == Some(task) || self.tasks.contains(&task)
    }
}

pub struct Registry {
    slots: [Slot; MAX_USER_APPS],
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|i| {
                Slot::empty(SlotId::for_index_and_gen(i, Generation::ZERO))
            }),
        }
    }

    /// Checks that `id` still names the slot's current occupancy.
    pub fn validate(&self, id: SlotId) -> Result<usize, RegistryError> {
        match self.slots.get(id.index()) {
            Some(s) if s.id == id => Ok(id.index()),
            _ => Err(RegistryError::StaleSlot),
        }
    }

    pub fn slot(&self, id: SlotId) -> Result<&Slot, RegistryError> {
        let i = self.validate(id)?;
        Ok(&self.slots[i])
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut Slot, RegistryError> {
        let i = self.validate(id)?;
        Ok(&mut self.slots[i])
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots.iter()
    }

    /// The slot holding (or being loaded with) `name`. Names are compared as
    /// stored, so an over-long name matches its truncated form.
    pub fn find(&self, name: &str) -> Option<SlotId> {
        let name = app_name(name);
        self.slots
            .iter()
            .find(|s| s.state != SlotState::Empty && s.name == name)
            .map(|s| s.id)
    }

    /// Returns the slot already holding `name`, or reserves the first empty
    /// one for it.
    pub fn find_or_allocate_slot(
        &mut self,
        name: &str,
    ) -> Result<SlotId, RegistryError> {
        if let Some(id) = self.find(name) {
            return Ok(id);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state == SlotState::Empty)
            .ok_or(RegistryError::AllSlotsFull)?;
        slot.state = SlotState::Reserved;
        slot.name = app_name(name);
        Ok(slot.id)
    }

    /// Gives back a slot reserved by `find_or_allocate_slot` whose load did
    /// not go through. Occupied slots are left alone.
    pub fn release_reservation(&mut self, id: SlotId) {
        if let Ok(s) = self.slot_mut(id) {
            if s.state == SlotState::Reserved {
                *s = Slot::empty(id.next_generation());
            }
        }
    }

    /// Records the loaded image for a reserved slot.
    pub fn set_image(
        &mut self,
        id: SlotId,
        image: AppProperties,
    ) -> Result<(), RegistryError> {
        self.slot_mut(id)?.image = Some(image);
        Ok(())
    }

    /// Creates the application's main task and marks the slot running.
    pub fn start_main(
        &mut self,
        sched: &mut dyn Scheduler,
        mem: &mut dyn TaskMemory,
        id: SlotId,
        entry: EntryPoint,
        stack_words: usize,
        priority: Priority,
    ) -> Result<TaskHandle, RegistryError> {
        let slot = self.slot_mut(id)?;
        if slot.state != SlotState::Reserved {
            return Err(RegistryError::Empty);
        }
        let spec = TaskSpec {
            entry,
            name: &slot.name,
            stack_words,
            priority,
            number: TaskNumber::for_slot(id.index(), 0),
        };
        let handle = sched.create_task(&spec, mem)?;
        slot.main = Some(handle);
        slot.state = SlotState::Running;
        Ok(handle)
    }

    /// Creates a subordinate task for an application.
    ///
    /// Fails with `ResourceExhausted`, without asking the scheduler, once the
    /// slot holds `MAX_USER_TASKS` subordinates.
    pub fn create_task(
        &mut self,
        sched: &mut dyn Scheduler,
        mem: &mut dyn TaskMemory,
        id: SlotId,
        entry: EntryPoint,
        name: &str,
        stack_words: usize,
        priority: Priority,
    ) -> Result<TaskHandle, RegistryError> {
        let slot = self.slot_mut(id)?;
        if !slot.state.is_occupied() {
            return Err(RegistryError::Empty);
        }
        if slot.tasks.is_full() {
            return Err(RegistryError::ResourceExhausted);
        }
        let ordinal = slot.tasks.len() as u32 + 1;
        let spec = TaskSpec {
            entry,
            name,
            stack_words,
            priority,
            number: TaskNumber::for_slot(id.index(), ordinal),
        };
        let handle = sched.create_task(&spec, mem)?;
        // Cannot fail: fullness was checked above.
        let _ = slot.tasks.push(handle);
        Ok(handle)
    }

    pub fn slot_for_handle(&self, task: TaskHandle) -> Option<SlotId> {
        self.slots.iter().find(|s| s.owns(task)).map(|s| s.id)
    }

    pub fn slot_for_task_number(&self, n: TaskNumber) -> Option<SlotId> {
        match n.owner() {
            abi::Owner::Kernel => None,
            abi::Owner::Slot(i) => self
                .slots
                .get(i)
                .filter(|s| s.state.is_occupied())
                .map(|s| s.id),
        }
    }

    pub fn main_handle(&self, id: SlotId) -> Option<TaskHandle> {
        self.slot(id).ok()?.main
    }

    pub fn register_hooks(
        &mut self,
        id: SlotId,
        pre_suspend: Option<Hook>,
        post_resume: Option<Hook>,
    ) -> Result<(), RegistryError> {
        let slot = self.slot_mut(id)?;
        if !slot.state.is_occupied() {
            return Err(RegistryError::Empty);
        }
        slot.hooks = AppHooks {
            pre_suspend,
            post_resume,
        };
        Ok(())
    }

    pub fn clear_hooks(&mut self, id: SlotId) {
        if let Ok(s) = self.slot_mut(id) {
            s.hooks = AppHooks::default();
        }
    }

    pub fn set_state(
        &mut self,
        id: SlotId,
        state: SlotState,
    ) -> Result<(), RegistryError> {
        self.slot_mut(id)?.state = state;
        Ok(())
    }

    /// Empties the slot and bumps its generation, so that `id` goes stale.
    pub fn clear(&mut self, id: SlotId) -> Result<(), RegistryError> {
        let slot = self.slot_mut(id)?;
        *slot = Slot::empty(id.next_generation());
        Ok(())
    }

    /// First occupied slot after `index`, wrapping, not counting `index`
    /// itself.
    pub fn next_occupied_after(&self, index: usize) -> Option<SlotId> {
        (1..MAX_USER_APPS)
            .map(|k| (index + k) % MAX_USER_APPS)
            .map(|i| &self.slots[i])
            .find(|s| s.state.is_occupied())
            .map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeScheduler, SchedEvent};
    use crate::heap::RoutedHeap;

    #[test]
    fn find_or_allocate_reuses_by_name() {
        let mut r = Registry::new();
        let a = r.find_or_allocate_slot("a.app").unwrap();
        let b = r.find_or_allocate_slot("b.app").unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(r.find_or_allocate_slot("a.app").unwrap(), a);
        assert_eq!(r.slot(a).unwrap().state(), SlotState::Reserved);
    }

    #[test]
    fn long_names_find_their_truncated_slot() {
        let mut r = Registry::new();
        let long = "a-very-long-application-name-that-overflows.app";
        assert!(long.len() > abi::APP_NAME_LEN);
        let a = r.find_or_allocate_slot(long).unwrap();
        assert_eq!(r.find(long), Some(a));
        assert_eq!(r.find_or_allocate_slot(long).unwrap(), a);
        assert_eq!(r.slots().filter(|s| s.state() != SlotState::Empty).count(), 1);
    }

    #[test]
    fn all_slots_full() {
        let mut r = Registry::new();
        for i in 0..MAX_USER_APPS {
            r.find_or_allocate_slot(&format!("{i}.app")).unwrap();
        }
        assert_eq!(
            r.find_or_allocate_slot("one-too-many.app"),
            Err(RegistryError::AllSlotsFull)
        );
    }

    #[test]
    fn tasks_get_numbers_from_their_slot_band() {
        let mut heap = fake::heap_manager();
        let mut sched = FakeScheduler::default();
        let mut r = Registry::new();
        r.find_or_allocate_slot("a.app").unwrap();
        let b = r.find_or_allocate_slot("b.app").unwrap();
        let mut mem = RoutedHeap::new(&mut heap, RegionId::Kernel);

        let main = r
            .start_main(&mut sched, &mut mem, b, EntryPoint(4), 64, Priority(5))
            .unwrap();
        let sub = r
            .create_task(
                &mut sched,
                &mut mem,
                b,
                EntryPoint(8),
                "worker",
                64,
                Priority(3),
            )
            .unwrap();

        assert_eq!(sched.number_of(main), Some(TaskNumber(200)));
        assert_eq!(sched.number_of(sub), Some(TaskNumber(201)));
        assert_eq!(r.slot_for_handle(sub), Some(b));
        assert_eq!(r.slot_for_task_number(TaskNumber(201)), Some(b));
        assert_eq!(r.slot_for_task_number(TaskNumber(42)), None);
        assert_eq!(r.main_handle(b), Some(main));
    }

    #[test]
    fn task_limit_registers_nothing() {
        let mut heap = fake::heap_manager();
        let mut sched = FakeScheduler::default();
        let mut r = Registry::new();
        let a = r.find_or_allocate_slot("a.app").unwrap();
        let mut mem = RoutedHeap::new(&mut heap, RegionId::Kernel);
        r.start_main(&mut sched, &mut mem, a, EntryPoint(0), 32, Priority(1))
            .unwrap();
        for _ in 0..MAX_USER_TASKS {
            r.create_task(
                &mut sched,
                &mut mem,
                a,
                EntryPoint(0),
                "t",
                32,
                Priority(1),
            )
            .unwrap();
        }
        let created = sched.events().len();

        assert_eq!(
            r.create_task(
                &mut sched,
                &mut mem,
                a,
                EntryPoint(0),
                "t",
                32,
                Priority(1)
            ),
            Err(RegistryError::ResourceExhausted)
        );
        assert_eq!(sched.events().len(), created);
        assert_eq!(r.slot(a).unwrap().tasks().len(), MAX_USER_TASKS);
        assert!(matches!(
            sched.events().last(),
            Some(SchedEvent::Created(..))
        ));
    }

    #[test]
    fn clearing_makes_ids_stale() {
        let mut r = Registry::new();
        let a = r.find_or_allocate_slot("a.app").unwrap();
        r.clear(a).unwrap();
        assert_eq!(r.slot(a).err(), Some(RegistryError::StaleSlot));
        assert_eq!(r.register_hooks(a, None, None), Err(RegistryError::StaleSlot));

        let again = r.find_or_allocate_slot("a.app").unwrap();
        assert_eq!(again.index(), a.index());
        assert_ne!(again, a);
    }

    #[test]
    fn release_reservation_only_touches_reserved_slots() {
        let mut heap = fake::heap_manager();
        let mut sched = FakeScheduler::default();
        let mut r = Registry::new();
        let a = r.find_or_allocate_slot("a.app").unwrap();
        let mut mem = RoutedHeap::new(&mut heap, RegionId::Kernel);
        r.start_main(&mut sched, &mut mem, a, EntryPoint(0), 32, Priority(1))
            .unwrap();
        r.release_reservation(a);
        assert_eq!(r.slot(a).unwrap().state(), SlotState::Running);

        let b = r.find_or_allocate_slot("b.app").unwrap();
        r.release_reservation(b);
        assert_eq!(r.find("b.app"), None);
    }

    #[test]
    fn scan_wraps_and_skips_empty() {
        let mut heap = fake::heap_manager();
        let mut sched = FakeScheduler::default();
        let mut r = Registry::new();
        let mut mem = RoutedHeap::new(&mut heap, RegionId::Kernel);
        let a = r.find_or_allocate_slot("a.app").unwrap();
        let _b = r.find_or_allocate_slot("b.app").unwrap();
        r.start_main(&mut sched, &mut mem, a, EntryPoint(0), 32, Priority(1))
            .unwrap();
        // b is only reserved, so the scan from a wraps back without it.
        assert_eq!(r.next_occupied_after(a.index()), None);
        assert_eq!(r.next_occupied_after(2), Some(a));
    }
}
