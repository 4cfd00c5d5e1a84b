// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! On the target, this module defines the following binary interface to
//! debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is set to one (true) if
//!   the kernel reaches the `die` function (either explicitly or as a result of
//!   a `panic!`).
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine writes
//!   as much of the failure reason into this buffer (as UTF-8) as possible,
//!   truncating if the buffer fills. Trim trailing NUL bytes for printing.
//!
//! On the host there is nobody to read an epitaph, so `die` panics instead,
//! which lets tests observe heap corruption with `#[should_panic]`.

use core::fmt::Display;

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use core::fmt::Write;
        use core::sync::atomic::Ordering;

        /// Flag that gets set to `true` by all failure reporting functions,
        /// giving tools a one-stop-shop for doing kernel triage.
        #[used]
        static mut KERNEL_HAS_FAILED: bool = false;

        const EPITAPH_LEN: usize = 128;

        /// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of
        /// description of the event that caused the kernel to fail, padded
        /// with NULs.
        #[used]
        static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

        fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
            // Safety: interrupts are masked by the time anything dies, and the
            // flag below makes sure only one caller gets past this point.
            let previous_fail = unsafe {
                core::ptr::replace(
                    core::ptr::addr_of_mut!(KERNEL_HAS_FAILED),
                    true,
                )
            };
            if previous_fail {
                // Recursive failure. Panicking again would only make it worse.
                loop {
                    core::sync::atomic::fence(Ordering::SeqCst);
                }
            }

            // Safety: only the single successful caller above reaches here.
            unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
        }

        #[inline(never)]
        fn die_impl(msg: &dyn Display) -> ! {
            let buf = begin_epitaph();
            let mut writer = Eulogist { dest: buf };
            write!(writer, "{msg}").ok();

            loop {
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        struct Eulogist {
            dest: &'static mut [u8],
        }

        impl Write for Eulogist {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                let s = s.as_bytes();
                let n = s.len().min(self.dest.len());
                let (dest, leftovers) = {
                    let taken = core::mem::take(&mut self.dest);
                    taken.split_at_mut(n)
                };
                dest.copy_from_slice(&s[..n]);
                self.dest = leftovers;
                Ok(())
            }
        }

        #[panic_handler]
        fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
            die(info)
        }
    } else {
        #[inline(never)]
        fn die_impl(msg: &dyn Display) -> ! {
            panic!("kernel died: {msg}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "kernel died: heap corrupted")]
    fn die_panics_on_host() {
        die("heap corrupted");
    }
}
