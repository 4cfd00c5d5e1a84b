// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt ownership.
//!
//! Every vector has at most one owner, an application slot. Vectors the kernel
//! keeps for itself (see [`Vector::is_kernel_routed`]) are installed in
//! hardware pointing at the kernel's dispatcher, which forwards to the owner's
//! handler only while the owner is the current application. All other vectors
//! are handed to the owner's handler directly, and masked while the owner is
//! suspended.
//!
//! The timer vector is special: the scheduler owns the hardware timer, and the
//! kernel forwards ticks from its tick hook, so it is never attached or
//! detached in hardware.

use core::ptr::fn_addr_eq;

use abi::{SlotId, Vector};

use crate::err::IrqError;

/// Application interrupt handler.
pub type IsrFn = fn(Vector);

/// What gets installed in the hardware vector table.
#[derive(Copy, Clone, Debug)]
pub enum Handler {
    Direct(IsrFn),
    /// The kernel's dispatcher, which calls back into `Router::dispatch`.
    Dispatcher,
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Handler::Direct(a), Handler::Direct(b)) => fn_addr_eq(*a, *b),
            (Handler::Dispatcher, Handler::Dispatcher) => true,
            _ => false,
        }
    }
}

impl Eq for Handler {}

/// The interrupt controller.
pub trait IrqHardware {
    fn attach(
        &mut self,
        vector: Vector,
        priority: u8,
        handler: Handler,
    ) -> Result<(), IrqError>;
    fn detach(&mut self, vector: Vector);
    fn set_masked(&mut self, vector: Vector, masked: bool);
}

#[derive(Copy, Clone, Debug)]
pub struct Binding {
    pub owner: SlotId,
    pub isr: IsrFn,
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && fn_addr_eq(self.isr, other.isr)
    }
}

impl Eq for Binding {}

pub struct Router {
    table: [Option<Binding>; Vector::COUNT],
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub const fn new() -> Self {
        Self {
            table: [None; Vector::COUNT],
        }
    }

    pub fn binding(&self, vector: Vector) -> Option<Binding> {
        self.table[vector.index()]
    }

    /// Gives `owner` the vector. On rejection from the hardware, the table is
    /// left as it was.
    pub fn attach(
        &mut self,
        hw: &mut dyn IrqHardware,
        owner: SlotId,
        vector: Vector,
        priority: u8,
        isr: IsrFn,
    ) -> Result<(), IrqError> {
        if vector.is_kernel_routed() {
            if !vector.is_tick() {
                hw.attach(vector, priority, Handler::Dispatcher)?;
            }
        } else {
            hw.attach(vector, priority, Handler::Direct(isr))?;
        }
        self.table[vector.index()] = Some(Binding { owner, isr });
        Ok(())
    }

    pub fn detach(&mut self, hw: &mut dyn IrqHardware, vector: Vector) {
        self.table[vector.index()] = None;
        if !vector.is_tick() {
            hw.detach(vector);
        }
    }

    /// Forwards a kernel-routed vector to its owner, if the owner is
    /// `current`. Returns whether a handler ran.
    pub fn dispatch(&self, vector: Vector, current: Option<SlotId>) -> bool {
        match self.table[vector.index()] {
            Some(b) if Some(b.owner) == current => {
                (b.isr)(vector);
                true
            }
            _ => false,
        }
    }

    fn owned_by(&self, owner: SlotId) -> impl Iterator<Item = Vector> + '_ {
        self.table
            .iter()
            .enumerate()
            .filter(move |(_, b)| b.is_some_and(|b| b.owner == owner))
            .filter_map(|(i, _)| {
                num_traits::FromPrimitive::from_usize(i)
            })
    }

    /// Detaches everything `owner` holds.
    pub fn release_slot(&mut self, hw: &mut dyn IrqHardware, owner: SlotId) {
        let mut owned = heapless::Vec::<Vector, { Vector::COUNT }>::new();
        for v in self.owned_by(owner) {
            // Capacity is the vector count, so this cannot fail.
            let _ = owned.push(v);
        }
        for v in owned {
            self.detach(hw, v);
        }
    }

    /// Masks or unmasks `owner`'s directly-attached vectors. Kernel-routed
    /// vectors stay unmasked; the kernel only forwards them to a running
    /// current application.
    pub fn set_slot_masked(
        &self,
        hw: &mut dyn IrqHardware,
        owner: SlotId,
        masked: bool,
    ) {
        for v in self.owned_by(owner).filter(|v| !v.is_kernel_routed()) {
            hw.set_masked(v, masked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeIrq;
    use abi::Generation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn count(_: Vector) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    fn other(_: Vector) {}

    fn slot(i: usize) -> SlotId {
        SlotId::for_index_and_gen(i, Generation::ZERO)
    }

    #[test]
    fn routed_vectors_install_the_dispatcher() {
        let mut hw = FakeIrq::default();
        let mut r = Router::new();
        r.attach(&mut hw, slot(0), Vector::Uart0, 3, count).unwrap();
        r.attach(&mut hw, slot(0), Vector::I2s, 3, other).unwrap();
        r.attach(&mut hw, slot(0), Vector::Timers, 3, count).unwrap();

        assert_eq!(hw.handler(Vector::Uart0), Some(Handler::Dispatcher));
        assert!(matches!(hw.handler(Vector::I2s), Some(Handler::Direct(_))));
        assert_eq!(hw.handler(Vector::Timers), None);
        assert_eq!(r.binding(Vector::Timers).map(|b| b.owner), Some(slot(0)));
    }

    #[test]
    fn handlers_compare_by_function_address() {
        let mut hw = FakeIrq::default();
        let mut r = Router::new();
        r.attach(&mut hw, slot(0), Vector::I2s, 3, other).unwrap();

        assert_eq!(hw.handler(Vector::I2s), Some(Handler::Direct(other)));
        assert_ne!(hw.handler(Vector::I2s), Some(Handler::Direct(count)));
        assert_ne!(hw.handler(Vector::I2s), Some(Handler::Dispatcher));
        assert_eq!(
            r.binding(Vector::I2s),
            Some(Binding { owner: slot(0), isr: other })
        );
        assert_ne!(
            r.binding(Vector::I2s),
            Some(Binding { owner: slot(1), isr: other })
        );
    }

    #[test]
    fn dispatch_only_reaches_current_owner() {
        let mut hw = FakeIrq::default();
        let mut r = Router::new();
        r.attach(&mut hw, slot(1), Vector::Ethernet, 0, count).unwrap();

        let before = HITS.load(Ordering::SeqCst);
        assert!(!r.dispatch(Vector::Ethernet, Some(slot(0))));
        assert!(!r.dispatch(Vector::Ethernet, None));
        assert!(!r.dispatch(Vector::Ethernet, Some(slot(1).next_generation())));
        assert!(r.dispatch(Vector::Ethernet, Some(slot(1))));
        assert!(HITS.load(Ordering::SeqCst) > before);
        assert!(!r.dispatch(Vector::UsbDevice, Some(slot(1))));
    }

    #[test]
    fn timer_is_never_touched_in_hardware() {
        let mut hw = FakeIrq::default();
        let mut r = Router::new();
        r.attach(&mut hw, slot(0), Vector::Timers, 0, other).unwrap();
        r.detach(&mut hw, Vector::Timers);
        assert!(hw.detached().is_empty());
        assert_eq!(r.binding(Vector::Timers), None);

        r.attach(&mut hw, slot(0), Vector::Gpio, 0, other).unwrap();
        r.detach(&mut hw, Vector::Gpio);
        assert_eq!(hw.detached(), &[Vector::Gpio]);
    }

    #[test]
    fn hardware_rejection_leaves_table_alone() {
        let mut hw = FakeIrq::default();
        hw.reject(Vector::Can0);
        let mut r = Router::new();
        assert_eq!(
            r.attach(&mut hw, slot(0), Vector::Can0, 0, other),
            Err(IrqError::Rejected)
        );
        assert_eq!(r.binding(Vector::Can0), None);
    }

    #[test]
    fn release_and_mask_follow_ownership() {
        let mut hw = FakeIrq::default();
        let mut r = Router::new();
        r.attach(&mut hw, slot(0), Vector::I2s, 0, other).unwrap();
        r.attach(&mut hw, slot(0), Vector::Uart0, 0, other).unwrap();
        r.attach(&mut hw, slot(1), Vector::Pwm, 0, other).unwrap();

        r.set_slot_masked(&mut hw, slot(0), true);
        assert!(hw.is_masked(Vector::I2s));
        assert!(!hw.is_masked(Vector::Uart0));
        assert!(!hw.is_masked(Vector::Pwm));
        r.set_slot_masked(&mut hw, slot(0), false);
        assert!(!hw.is_masked(Vector::I2s));

        r.release_slot(&mut hw, slot(0));
        assert_eq!(r.binding(Vector::I2s), None);
        assert_eq!(r.binding(Vector::Uart0), None);
        assert!(r.binding(Vector::Pwm).is_some());
    }
}
