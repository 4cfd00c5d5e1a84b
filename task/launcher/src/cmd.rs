// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console commands.

/// One console command. Each maps onto a single lifecycle operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command<'a> {
    /// `l <name>`: exit the current app and load `name`.
    Load(&'a str),
    /// `k`: exit the current app.
    Kill,
    /// `s`: suspend the current app.
    Suspend,
    /// `r`: resume the current app.
    Resume,
    /// `w <name>`: suspend the current app and switch to `name`.
    Swap(&'a str),
}

/// Command kind, without its argument, for tracing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Load,
    Kill,
    Suspend,
    Resume,
    Swap,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The first byte of the line, or 0 for an empty line.
    Unknown(u8),
    MissingName,
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Result<Self, ParseError> {
        let op = line.bytes().next().unwrap_or(0);
        let name = || {
            let rest = line.get(1..).unwrap_or("").trim();
            if rest.is_empty() {
                Err(ParseError::MissingName)
            } else {
                Ok(rest)
            }
        };
        match op {
            b'l' => Ok(Command::Load(name()?)),
            b'k' => Ok(Command::Kill),
            b's' => Ok(Command::Suspend),
            b'r' => Ok(Command::Resume),
            b'w' => Ok(Command::Swap(name()?)),
            other => Err(ParseError::Unknown(other)),
        }
    }

    pub fn op(&self) -> Op {
        match self {
            Command::Load(_) => Op::Load,
            Command::Kill => Op::Kill,
            Command::Suspend => Op::Suspend,
            Command::Resume => Op::Resume,
            Command::Swap(_) => Op::Swap,
        }
    }
}
