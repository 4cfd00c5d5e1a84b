// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console receive side: bytes queued by the UART interrupt, taken off a line
//! at a time by the launcher task.

use core::fmt;

/// Receive queue depth.
pub const RX_BUFF_SIZE: usize = 256;
/// Longest command line kept; anything past it is dropped.
pub const LINE_LEN: usize = 80;

pub type Line = heapless::String<LINE_LEN>;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Overflow;

pub struct RxQueue {
    buf: heapless::Deque<u8, RX_BUFF_SIZE>,
}

impl Default for RxQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RxQueue {
    pub const fn new() -> Self {
        Self {
            buf: heapless::Deque::new(),
        }
    }

    /// Queues a received byte. Returns `true` once a carriage return has
    /// arrived, i.e. a line is ready.
    pub fn receive(&mut self, byte: u8) -> Result<bool, Overflow> {
        self.buf.push_back(byte).map_err(|_| Overflow)?;
        Ok(byte == b'\r')
    }

    pub fn has_line(&self) -> bool {
        self.buf.iter().any(|&b| b == b'\r')
    }

    /// Takes bytes up to and including the next carriage return, applying
    /// backspaces and echoing what is kept. Control characters are dropped.
    pub fn get_line(&mut self, echo: &mut impl fmt::Write) -> Result<Line, fmt::Error> {
        let mut line = Line::new();
        while let Some(c) = self.buf.pop_front() {
            match c {
                b'\r' => break,
                BACKSPACE | DELETE => {
                    if line.pop().is_some() {
                        echo.write_char(BACKSPACE as char)?;
                    }
                }
                b' '..=b'~' => {
                    if line.push(c as char).is_ok() {
                        echo.write_char(c as char)?;
                    }
                }
                _ => {}
            }
        }
        echo.write_char('\n')?;
        Ok(line)
    }
}
