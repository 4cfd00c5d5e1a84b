// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application launcher.
//!
//! The launcher watches the console for single-letter commands and turns each
//! into one lifecycle operation on the kernel, printing the outcome. It can
//! also load an application at boot, and swap to another one once a fixed
//! number of seconds have passed (the demo configuration).
//!
//! Console output goes through any `core::fmt::Write`, so that the same code
//! drives the UART on the board and a `String` in tests.

#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};

use abi::SlotId;
use kern::err::{LifecycleError, LoadError};
use kern::irq::IrqHardware;
use kern::loader::Loader;
use kern::sched::Scheduler;
use kern::Kernel;
use ringbuf::{ringbuf_entry, Ringbuf};

pub mod cmd;
pub mod uart;

pub use cmd::{Command, Op, ParseError};
use uart::RxQueue;

/// App loaded at boot in the demo configuration.
pub const DEMO_BOOT_APP: &str = "certs.app";
/// App the demo configuration swaps to.
pub const DEMO_SWAP_APP: &str = "Demo2.app";
pub const DEMO_SWAP_SECS: u32 = 30;

const TRACE_DEPTH: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Overflow,
    Command(Op),
    BadCommand(ParseError),
    Failed(LifecycleError),
    AutoSwap,
}

/// Swaps to `target` once, after `after_secs` seconds.
#[derive(Copy, Clone, Debug)]
pub struct AutoSwap {
    target: &'static str,
    after_secs: u32,
    elapsed: u32,
    fired: bool,
}

impl AutoSwap {
    pub const fn new(target: &'static str, after_secs: u32) -> Self {
        Self {
            target,
            after_secs,
            elapsed: 0,
            fired: false,
        }
    }

    /// Counts one second. Returns the target the first time the deadline is
    /// reached, and never again.
    pub fn tick(&mut self) -> Option<&'static str> {
        if self.fired {
            return None;
        }
        self.elapsed += 1;
        if self.elapsed >= self.after_secs {
            self.fired = true;
            Some(self.target)
        } else {
            None
        }
    }
}

pub struct Launcher {
    rx: RxQueue,
    auto_swap: Option<AutoSwap>,
    trace: Ringbuf<Trace, TRACE_DEPTH>,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

fn heap_start<S, L, H>(kernel: &Kernel<S, L, H>, slot: SlotId) -> usize
where
    S: Scheduler,
    L: Loader,
    H: IrqHardware,
{
    kernel
        .registry()
        .slot(slot)
        .ok()
        .and_then(|s| s.image())
        .map_or(0, |p| p.heap_start)
}

impl Launcher {
    pub const fn new() -> Self {
        Self {
            rx: RxQueue::new(),
            auto_swap: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// The demo configuration: swap to [`DEMO_SWAP_APP`] after
    /// [`DEMO_SWAP_SECS`].
    pub const fn demo() -> Self {
        Self {
            rx: RxQueue::new(),
            auto_swap: Some(AutoSwap::new(DEMO_SWAP_APP, DEMO_SWAP_SECS)),
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn with_auto_swap(mut self, auto_swap: AutoSwap) -> Self {
        self.auto_swap = Some(auto_swap);
        self
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_DEPTH> {
        &self.trace
    }

    /// Receive interrupt: queues one byte. Returns whether a full line is now
    /// waiting.
    pub fn on_rx(&mut self, byte: u8, out: &mut impl Write) -> Result<bool, fmt::Error> {
        match self.rx.receive(byte) {
            Ok(ready) => Ok(ready),
            Err(uart::Overflow) => {
                ringbuf_entry!(self.trace, Trace::Overflow);
                out.write_str("ERROR! Buffer Overflow")?;
                Ok(false)
            }
        }
    }

    pub fn boot<S, L, H>(
        &mut self,
        kernel: &mut Kernel<S, L, H>,
        initial: Option<&str>,
        out: &mut impl Write,
    ) -> fmt::Result
    where
        S: Scheduler,
        L: Loader,
        H: IrqHardware,
    {
        out.write_str("Started launcher..\r\n")?;
        match initial {
            Some(name) => self.execute(kernel, Command::Load(name), out),
            None => Ok(()),
        }
    }

    /// Runs every complete line waiting in the receive queue.
    pub fn poll<S, L, H>(
        &mut self,
        kernel: &mut Kernel<S, L, H>,
        out: &mut impl Write,
    ) -> fmt::Result
    where
        S: Scheduler,
        L: Loader,
        H: IrqHardware,
    {
        while self.rx.has_line() {
            let line = self.rx.get_line(out)?;
            self.run_line(kernel, &line, out)?;
        }
        Ok(())
    }

    pub fn run_line<S, L, H>(
        &mut self,
        kernel: &mut Kernel<S, L, H>,
        line: &str,
        out: &mut impl Write,
    ) -> fmt::Result
    where
        S: Scheduler,
        L: Loader,
        H: IrqHardware,
    {
        match Command::parse(line) {
            Ok(cmd) => self.execute(kernel, cmd, out),
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::BadCommand(e));
                match e {
                    ParseError::Unknown(c) => write!(out, "unknown cmd {c}\r\n"),
                    ParseError::MissingName => out.write_str("missing app name\r\n"),
                }
            }
        }
    }

    /// Counts a second toward the auto-swap, performing it when due.
    pub fn second_elapsed<S, L, H>(
        &mut self,
        kernel: &mut Kernel<S, L, H>,
        out: &mut impl Write,
    ) -> fmt::Result
    where
        S: Scheduler,
        L: Loader,
        H: IrqHardware,
    {
        match self.auto_swap.as_mut().and_then(AutoSwap::tick) {
            Some(target) => {
                ringbuf_entry!(self.trace, Trace::AutoSwap);
                self.execute(kernel, Command::Swap(target), out)
            }
            None => Ok(()),
        }
    }

    pub fn execute<S, L, H>(
        &mut self,
        kernel: &mut Kernel<S, L, H>,
        cmd: Command<'_>,
        out: &mut impl Write,
    ) -> fmt::Result
    where
        S: Scheduler,
        L: Loader,
        H: IrqHardware,
    {
        ringbuf_entry!(self.trace, Trace::Command(cmd.op()));
        match cmd {
            Command::Load(name) => match kernel.load(name) {
                Ok(slot) => write!(
                    out,
                    "Successfully Loaded Application:{:08x}\r\n",
                    heap_start(kernel, slot)
                ),
                Err(e) => self.load_failed(name, e, out),
            },
            Command::Kill => {
                let Some(slot) = kernel.current() else {
                    return Ok(());
                };
                let handle = kernel.main_handle(slot).map_or(0, |h| h.0);
                write!(out, "Successfully killed current app {handle:x}!\r\n")?;
                if let Err(e) = kernel.exit(slot) {
                    self.failed(e, out)?;
                }
                match kernel.current() {
                    Some(next) => {
                        write!(out, "aindex: {}, resumed!\r\n", next.index())
                    }
                    None => Ok(()),
                }
            }
            Command::Suspend => {
                let Some(slot) = kernel.current() else {
                    return Ok(());
                };
                out.write_str("suspend!\r\n")?;
                match kernel.suspend(slot) {
                    Ok(()) => Ok(()),
                    Err(e) => self.failed(e, out),
                }
            }
            Command::Resume => {
                let Some(slot) = kernel.current() else {
                    return Ok(());
                };
                match kernel.resume(slot) {
                    Ok(()) => out.write_str("resume!\r\n"),
                    Err(e) => self.failed(e, out),
                }
            }
            Command::Swap(name) => self.swap(kernel, name, out),
        }
    }

    fn swap<S, L, H>(
        &mut self,
        kernel: &mut Kernel<S, L, H>,
        name: &str,
        out: &mut impl Write,
    ) -> fmt::Result
    where
        S: Scheduler,
        L: Loader,
        H: IrqHardware,
    {
        let prev = kernel.current();
        let existing = kernel.find(name);
        match kernel.swap(name) {
            Ok(slot) if existing == Some(slot) => {
                write!(out, "aindex: {}, resumed!\r\n", slot.index())
            }
            Ok(slot) => {
                write!(
                    out,
                    "Successfully Loaded another app:{:08x}\r\n",
                    heap_start(kernel, slot)
                )?;
                write!(out, "aindex: {}, started!\r\n", slot.index())
            }
            Err(LifecycleError::AllSlotsFull) => {
                self.load_failed(name, LifecycleError::AllSlotsFull, out)
            }
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::Failed(e));
                write!(out, "Error loading the app! {e}\r\n")?;
                let Some(prev) = prev.filter(|&p| kernel.current() == Some(p))
                else {
                    return Ok(());
                };
                match kernel.registry().slot(prev) {
                    Ok(s) => write!(
                        out,
                        "Successfully restored prev app {}!\r\n",
                        s.name()
                    ),
                    Err(_) => Ok(()),
                }
            }
        }
    }

    fn load_failed(
        &mut self,
        name: &str,
        e: LifecycleError,
        out: &mut impl Write,
    ) -> fmt::Result {
        ringbuf_entry!(self.trace, Trace::Failed(e));
        match e {
            LifecycleError::AllSlotsFull => write!(
                out,
                "Maximum apps reached, cannot load the new app {name}!\r\n"
            ),
            LifecycleError::LoadFailure(LoadError::NotFound) => {
                out.write_str("Application not found in SD card\r\n")
            }
            e => write!(out, "Error loading the app! {e}\r\n"),
        }
    }

    fn failed(&mut self, e: LifecycleError, out: &mut impl Write) -> fmt::Result {
        ringbuf_entry!(self.trace, Trace::Failed(e));
        write!(out, "{e}\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::fake::{self, FakeLoader, TestKernel};
    use kern::registry::SlotState;

    fn kernel() -> TestKernel {
        fake::kernel(
            FakeLoader::default()
                .with_image("certs.app", 0x10_0000, 0x1000, Some(0x3000))
                .with_image("Demo2.app", 0x20_0000, 0x5000, Some(0x3000)),
        )
    }

    fn type_line(l: &mut Launcher, k: &mut TestKernel, line: &str) -> String {
        let mut out = String::new();
        for b in line.bytes().chain([b'\r']) {
            l.on_rx(b, &mut out).unwrap();
        }
        out.clear();
        l.poll(k, &mut out).unwrap();
        out
    }

    #[test]
    fn console_session() {
        let mut k = kernel();
        let mut l = Launcher::new();
        let mut out = String::new();

        l.boot(&mut k, Some("certs.app"), &mut out).unwrap();
        assert_eq!(
            out,
            "Started launcher..\r\nSuccessfully Loaded Application:00001000\r\n"
        );

        let out = type_line(&mut l, &mut k, "w Demo2.app");
        assert!(out.starts_with("w Demo2.app\n"));
        assert!(out.contains("Successfully Loaded another app:00005000\r\n"));
        assert!(out.contains("aindex: 1, started!\r\n"));

        let out = type_line(&mut l, &mut k, "w certs.app");
        assert!(out.contains("aindex: 0, resumed!\r\n"));
        assert_eq!(k.loader().loads().len(), 2);

        let out = type_line(&mut l, &mut k, "k");
        assert!(out.contains("Successfully killed current app 1!\r\n"));
        assert!(out.contains("aindex: 1, resumed!\r\n"));
        assert_eq!(k.current().map(|s| s.index()), Some(1));
    }

    #[test]
    fn suspend_and_resume_current() {
        let mut k = kernel();
        let mut l = Launcher::new();
        l.boot(&mut k, Some("certs.app"), &mut String::new()).unwrap();
        let slot = k.current().unwrap();

        assert!(type_line(&mut l, &mut k, "s").contains("suspend!\r\n"));
        assert_eq!(k.slot_state(slot), Ok(SlotState::Suspended));
        assert!(type_line(&mut l, &mut k, "r").contains("resume!\r\n"));
        assert_eq!(k.slot_state(slot), Ok(SlotState::Running));
    }

    #[test]
    fn commands_without_an_app_print_nothing() {
        let mut k = kernel();
        let mut l = Launcher::new();
        for c in ["k", "s", "r"] {
            assert_eq!(type_line(&mut l, &mut k, c), format!("{c}\n"));
        }
    }

    #[test]
    fn failures_print_their_category() {
        let mut k = kernel();
        let mut l = Launcher::new();

        let out = type_line(&mut l, &mut k, "l nope.app");
        assert!(out.contains("Application not found in SD card\r\n"));

        let out = type_line(&mut l, &mut k, "z");
        assert!(out.contains("unknown cmd 122\r\n"));
        assert!(l.trace().contains(&Trace::BadCommand(ParseError::Unknown(b'z'))));

        type_line(&mut l, &mut k, "l certs.app");
        let out = type_line(&mut l, &mut k, "w nope.app");
        assert!(out.contains(
            "Error loading the app! load failure: application not found\r\n"
        ));
        assert!(out.contains("Successfully restored prev app certs.app!\r\n"));
        assert!(l.trace().contains(&Trace::Failed(LifecycleError::LoadFailure(
            LoadError::NotFound
        ))));
    }

    #[test]
    fn overflow_is_reported() {
        let mut l = Launcher::new();
        let mut out = String::new();
        for _ in 0..uart::RX_BUFF_SIZE {
            l.on_rx(b'x', &mut out).unwrap();
        }
        assert!(out.is_empty());
        assert!(!l.on_rx(b'\r', &mut out).unwrap());
        assert_eq!(out, "ERROR! Buffer Overflow");
        assert!(l.trace().contains(&Trace::Overflow));
    }

    #[test]
    fn demo_swaps_once() {
        let mut k = kernel();
        let mut l = Launcher::demo();
        let mut out = String::new();
        l.boot(&mut k, Some(DEMO_BOOT_APP), &mut out).unwrap();

        for _ in 1..DEMO_SWAP_SECS {
            l.second_elapsed(&mut k, &mut out).unwrap();
        }
        assert_eq!(k.find(DEMO_SWAP_APP), None);

        out.clear();
        l.second_elapsed(&mut k, &mut out).unwrap();
        assert!(out.contains("aindex: 1, started!\r\n"));
        assert_eq!(k.current(), k.find(DEMO_SWAP_APP));

        for _ in 0..2 * DEMO_SWAP_SECS {
            l.second_elapsed(&mut k, &mut out).unwrap();
        }
        assert_eq!(k.loader().loads().len(), 2);
        assert!(l.trace().contains(&Trace::AutoSwap));
    }

    #[test]
    fn auto_swap_fires_at_deadline() {
        let mut a = AutoSwap::new("x.app", 3);
        assert_eq!(a.tick(), None);
        assert_eq!(a.tick(), None);
        assert_eq!(a.tick(), Some("x.app"));
        assert_eq!(a.tick(), None);
    }
}
