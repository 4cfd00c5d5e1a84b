// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel, the launcher and the
//! application images it loads.

#![no_std]

use num_derive::FromPrimitive;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::FromBytes;

/// Task numbers below this value belong to the kernel; each application slot
/// owns a band of this many numbers above it.
pub const USER_TASK_BASE_ID: u32 = 100;

/// Size of the name field in an image header, and the capacity of
/// [`AppName`].
pub const APP_NAME_LEN: usize = 40;

/// Newest kernel API an image may target. Images that leave the field zero
/// are accepted as targeting the current API.
pub const KERNEL_API_VERSION: u32 = 1;

/// Heap start addresses in an image header are offsets into the 64 KiB SRAM
/// window; anything above is toolchain address-space tagging.
pub const SRAM_ADDRESS_MASK: u32 = 0xFFFF;

/// Names a particular occupancy of an application slot.
///
/// A `SlotId` combines two fields, a slot index and a generation number. The
/// generation number of a slot is incremented each time the slot is cleared,
/// so a `SlotId` captured before an application exited will not match the
/// slot's next occupant. This is the same trick `TaskId` plays in the task
/// table of a static kernel, applied to dynamically loaded applications.
///
/// The slot index is in the lower `SlotId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlotId(pub u16);

impl SlotId {
    /// Number of bits in a `SlotId` used to represent the slot index, rather
    /// than generation number.
    pub const INDEX_BITS: u32 = 8;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `SlotId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        SlotId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }

    pub fn next_generation(self) -> Self {
        Self::for_index_and_gen(self.index(), self.generation().next())
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Number stamped on every scheduler task so that the owner of the running
/// task can be recovered from the number alone.
///
/// Kernel tasks are numbered below [`USER_TASK_BASE_ID`]. Tasks belonging to
/// slot `i` are numbered `100 * (i + 1) + ordinal`, where ordinal 0 is the
/// application's main task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
pub struct TaskNumber(pub u32);

/// Who a [`TaskNumber`] belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Owner {
    Kernel,
    /// Slot index (not a `SlotId`; the number carries no generation).
    Slot(usize),
}

impl TaskNumber {
    pub const fn kernel(n: u32) -> Self {
        Self(n % USER_TASK_BASE_ID)
    }

    pub const fn for_slot(index: usize, ordinal: u32) -> Self {
        Self(USER_TASK_BASE_ID * (index as u32 + 1) + ordinal)
    }

    pub fn owner(self) -> Owner {
        if self.0 < USER_TASK_BASE_ID {
            Owner::Kernel
        } else {
            Owner::Slot((self.0 / USER_TASK_BASE_ID - 1) as usize)
        }
    }

    pub fn ordinal(self) -> u32 {
        self.0 % USER_TASK_BASE_ID
    }
}

/// Opaque handle to a scheduler task, as issued by the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct TaskHandle(pub u32);

/// Address of the first instruction of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct EntryPoint(pub u32);

/// Indicates priority of a task.
///
/// The scheduler these tasks run under counts upward: a numerically greater
/// priority is more important, and 0 is the idle level. Like its counterpart
/// in a static kernel, this type deliberately does not implement
/// `PartialOrd`/`Ord`; use `is_more_important_than`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Returns `self` if it names a level below `levels`, otherwise the
    /// level just under the top one, which is reserved for kernel services.
    pub fn clamp_to(self, levels: u8) -> Self {
        if self.0 >= levels {
            Self(levels.saturating_sub(2))
        } else {
            self
        }
    }
}

/// Hardware interrupt vectors of the target MCU, numbered as the vector
/// controller numbers them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum Vector {
    PowerManagement = 0,
    UsbHost = 1,
    UsbDevice = 2,
    Ethernet = 3,
    SdCard = 4,
    Can0 = 5,
    Can1 = 6,
    Camera = 7,
    SpiMaster = 8,
    SpiSlave0 = 9,
    SpiSlave1 = 10,
    I2cMaster = 11,
    I2cSlave = 12,
    Uart0 = 13,
    Uart1 = 14,
    I2s = 15,
    Pwm = 16,
    Timers = 17,
    Gpio = 18,
    Rtc = 19,
    Adc = 20,
    Dac = 21,
    SlowClock = 22,
}

impl Vector {
    pub const COUNT: usize = 23;

    /// Vectors the kernel keeps for itself and forwards to the current
    /// application through its dispatcher, rather than handing the hardware
    /// vector to the application directly.
    pub fn is_kernel_routed(self) -> bool {
        matches!(
            self,
            Vector::Timers | Vector::UsbDevice | Vector::Ethernet | Vector::Uart0
        )
    }

    /// The timer vector is driven from the scheduler tick and never attached
    /// or detached in hardware.
    pub fn is_tick(self) -> bool {
        self == Vector::Timers
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Application name, as carried in an image header.
pub type AppName = heapless::String<APP_NAME_LEN>;

/// Builds an [`AppName`] from `s`, truncating at a character boundary if `s`
/// is too long.
pub fn app_name(s: &str) -> AppName {
    let mut name = AppName::new();
    for c in s.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// What the loader reports about an image it has staged into program memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppProperties {
    pub name: AppName,
    pub version: u32,
    pub hash: u32,
    pub entry_point: EntryPoint,
    /// Start of the image's heap area in data memory.
    pub heap_start: usize,
    /// Size of the heap area, or `None` if it runs to the end of user RAM.
    pub heap_size: Option<usize>,
}

/// Application image header, found at the start of every image file.
///
/// All fields are little-endian.
#[derive(Clone, Debug)]
#[derive(
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct ImageHeader {
    pub file_format: U32,
    pub target_kernel_api: U32,
    /// NUL-padded UTF-8.
    pub name: [u8; APP_NAME_LEN],
    pub version: U32,
    pub hash: U32,
    pub entry_point: U32,
    pub heap_start: U32,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<ImageHeader>(),
    6 * 4 + APP_NAME_LEN
);

/// Reasons an image header can be refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeaderError {
    /// Fewer bytes than a header.
    Truncated,
    /// Image targets a kernel API newer than [`KERNEL_API_VERSION`].
    UnsupportedApi(u32),
    /// Name field is empty or is not UTF-8.
    BadName,
}

impl ImageHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Reads a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        let (header, _rest) = Self::read_from_prefix(bytes)
            .map_err(|_| HeaderError::Truncated)?;
        let api = header.target_kernel_api.get();
        if api > KERNEL_API_VERSION {
            return Err(HeaderError::UnsupportedApi(api));
        }
        header.name_str()?;
        Ok(header)
    }

    /// Name with NUL padding removed.
    pub fn name_str(&self) -> Result<&str, HeaderError> {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(APP_NAME_LEN);
        match core::str::from_utf8(&self.name[..end]) {
            Ok(s) if !s.is_empty() => Ok(s),
            _ => Err(HeaderError::BadName),
        }
    }

    /// Properties for the image, with the heap start masked into the SRAM
    /// window.
    pub fn properties(&self) -> Result<AppProperties, HeaderError> {
        Ok(AppProperties {
            name: app_name(self.name_str()?),
            version: self.version.get(),
            hash: self.hash.get(),
            entry_point: EntryPoint(self.entry_point.get()),
            heap_start: (self.heap_start.get() & SRAM_ADDRESS_MASK) as usize,
            heap_size: None,
        })
    }
}
