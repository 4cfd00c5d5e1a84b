// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VFW kernel.
//!
//! This is the layer between a preemptive scheduler and the applications that
//! get loaded, swapped and killed at runtime. It owns application slots, the
//! kernel and per-application heaps, and the interrupt vectors applications
//! ask for.
//!
//! The scheduler, the image loader and the interrupt controller are reached
//! through traits ([`sched::Scheduler`], [`loader::Loader`],
//! [`irq::IrqHardware`]), so that the same code runs on the board and under
//! `cargo test` with the doubles in `fake`.
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes come from `kconfig.toml` at build
//!    time; nothing is allocated to grow them.
//! 2. No ambient state. The current application is a field of
//!    [`lifecycle::Kernel`], passed explicitly to whatever needs it.
//! 3. A strong preference for safe code where reasonable. The heap is the
//!    one place that has to deal in raw memory.

#![cfg_attr(not(any(test, feature = "fake")), no_std)]

pub mod config;
pub mod err;
pub mod fail;
pub mod heap;
pub mod irq;
pub mod lifecycle;
pub mod loader;
pub mod registry;
pub mod sched;
pub mod trace;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use lifecycle::Kernel;
