// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing kernel and launcher events
//!
//! Neither the kernel nor the launcher has anywhere to print to when something
//! goes wrong mid-transition: the UART belongs to the command line, and most
//! interesting events happen inside a critical section. Instead, each
//! component owns a fixed-size ring buffer of small `Copy` payloads, which can
//! be read back from a debugger or, on the host, by tests.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! ## Creating a ring buffer
//!
//! A ring buffer is an ordinary value, usually a field of the structure whose
//! behavior it records:
//!
//! ```
//! struct Controller {
//!     trace: Ringbuf<Trace, 64>,
//! }
//!
//! let c = Controller { trace: Ringbuf::new(Trace::None) };
//! ```
//!
//! Entries are recorded with [`ringbuf_entry!`], which stamps the entry with
//! the source line it was recorded from:
//!
//! ```
//! ringbuf_entry!(self.trace, Trace::Suspended(slot));
//! ```
//!
//! When an entry is recorded with an identical payload and line to the most
//! recent entry, that entry's `count` is incremented rather than consuming a
//! new slot, so a tight retry loop does not wash out the history.
//!
//! ## Inspecting a ring buffer via GDB
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print KERNEL.trace
//! $1 = ringbuf::Ringbuf<kern::trace::Trace, 64> {
//!   last: core::option::Option<usize>::Some(3),
//!   buffer: [
//!     ringbuf::RingbufEntry<kern::trace::Trace> {
//!       line: 212,
//!       generation: 1,
//!       count: 1,
//!       payload: kern::trace::Trace::Loaded(...)
//!     },...
//! ```

#![no_std]

/// Inserts data into a ring buffer.
///
/// `ringbuf_entry!(buf, expr)` records `expr` in `buf`, which must be a place
/// expression naming a [`Ringbuf`] that can be mutably borrowed.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before borrowing the buffer, so the payload
        // expression may itself read from the structure owning the buffer.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    /// Makes an empty ring buffer with every slot holding `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // `last` is None until the first insertion. Treating that as an
        // out-of-range index means the first entry lands in slot 0 and never
        // bumps the count of a slot that was never written.
        let last = self.last.unwrap_or(usize::MAX);

        // `get_mut` also covers a corrupted `last`, in which case we simply
        // start over at 0 below.
        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Compare rather than take a remainder: the targets have no hardware
        // divide, and usize::MAX + 1 must land on 0.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if any.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Recorded entries, oldest first. Slots never written are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last.wrapping_add(1),
            None => self.buffer.len(),
        };
        let (newer, older) = self.buffer.split_at(start.min(N));
        older.iter().chain(newer.iter()).filter(|e| e.count != 0)
    }

    /// Whether any entry with a matching payload is still in the buffer.
    pub fn contains(&self, payload: &T) -> bool {
        self.iter().any(|e| &e.payload == payload)
    }
}
