// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-region heap.
//!
//! There is one kernel region, fixed for the life of the system, and up to one
//! user region per application slot. Only one user region is *bound* at a
//! time: the one belonging to the application that is current. A suspended
//! application's region keeps its free list (the headers live in the region
//! itself), so when the application is resumed and its region rebound, its
//! live allocations are exactly where it left them.
//!
//! Each region is a first-fit allocator over an address-ordered free list.
//! Every block starts with a [`BlockHeader`]; the top bit of the size marks a
//! block as allocated, and a live block's link is cleared. Adjacent free
//! blocks are always merged, so the free list never holds two blocks that
//! touch.
//!
//! This is the only module that does pointer arithmetic on heap memory.

use core::mem::size_of;
use core::ptr::NonNull;

use abi::{Owner, SlotId, TaskNumber};

use crate::config::{KernelConfig, BYTE_ALIGNMENT, MAX_USER_APPS};
use crate::err::HeapError;
use crate::fail;

const ALIGN_MASK: usize = BYTE_ALIGNMENT - 1;

/// Set in a block's size while the block is allocated.
const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);

/// Free-list terminator. Links are byte offsets from the region base.
const LINK_NONE: usize = usize::MAX;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct BlockHeader {
    /// Offset of the next free block, or `LINK_NONE`. Always `LINK_NONE`
    /// while the block is allocated.
    next: usize,
    /// Block size in bytes, header included, with `ALLOCATED_BIT` set while
    /// allocated.
    size: usize,
}

const fn align_up(n: usize) -> usize {
    (n + ALIGN_MASK) & !ALIGN_MASK
}

/// Header size rounded up so that payloads stay aligned.
pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>());

/// Blocks are only split if the remainder is larger than this.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE * 2;

/// Which region an allocation comes from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionId {
    Kernel,
    User(SlotId),
}

/// A contiguous span of memory managed as one heap.
pub struct Region {
    /// Aligned start of the region.
    base: NonNull<u8>,
    /// Usable length, a multiple of `BYTE_ALIGNMENT`.
    len: usize,
    /// Offset of the lowest free block.
    head: usize,
    free_bytes: usize,
    min_ever_free: usize,
    initialised: bool,
}

// Safety: a Region is the sole owner of the memory it spans; moving it to
// another context moves that ownership with it.
unsafe impl Send for Region {}

impl Region {
    /// Manages `len` bytes at `base`. The start is rounded up and the length
    /// rounded down to `BYTE_ALIGNMENT`.
    ///
    /// Returns `None` if nothing usable remains after alignment.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes, and used by nothing
    /// else, for as long as the region (or any pointer it hands out) lives.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        let addr = base as usize;
        let aligned = addr.checked_add(ALIGN_MASK)? & !ALIGN_MASK;
        let skip = aligned - addr;
        let len = len.checked_sub(skip)? & !ALIGN_MASK;
        if len < MIN_BLOCK_SIZE {
            return None;
        }
        Some(Self {
            base: NonNull::new(base.wrapping_add(skip))?,
            len,
            head: LINK_NONE,
            free_bytes: 0,
            min_ever_free: 0,
            initialised: false,
        })
    }

    /// Manages a static buffer, such as the kernel heap array.
    pub fn from_static(mem: &'static mut [u8]) -> Option<Self> {
        // Safety: the exclusive 'static borrow is never released.
        unsafe { Self::new(mem.as_mut_ptr(), mem.len()) }
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn end_addr(&self) -> usize {
        self.base_addr() + self.len
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr < self.end_addr()
    }

    pub fn free_bytes(&self) -> usize {
        if self.initialised {
            self.free_bytes
        } else {
            self.len
        }
    }

    pub fn min_ever_free(&self) -> usize {
        if self.initialised {
            self.min_ever_free
        } else {
            self.len
        }
    }

    fn read(&self, off: usize) -> BlockHeader {
        // Safety: callers only pass offsets of block headers, which are
        // aligned and inside the region.
        unsafe { self.base.as_ptr().add(off).cast::<BlockHeader>().read() }
    }

    fn write(&mut self, off: usize, h: BlockHeader) {
        // Safety: as for `read`.
        unsafe { self.base.as_ptr().add(off).cast::<BlockHeader>().write(h) }
    }

    fn ensure_init(&mut self) {
        if self.initialised {
            return;
        }
        self.write(
            0,
            BlockHeader {
                next: LINK_NONE,
                size: self.len,
            },
        );
        self.head = 0;
        self.free_bytes = self.len;
        self.min_ever_free = self.len;
        self.initialised = true;
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.ensure_init();

        if size == 0 || size & ALLOCATED_BIT != 0 {
            return Err(HeapError::OutOfMemory);
        }
        let wanted = size
            .checked_add(HEADER_SIZE + ALIGN_MASK)
            .ok_or(HeapError::OutOfMemory)?
            & !ALIGN_MASK;
        if wanted & ALLOCATED_BIT != 0 || wanted > self.free_bytes {
            return Err(HeapError::OutOfMemory);
        }

        let mut prev = None;
        let mut cur = self.head;
        let mut block = loop {
            if cur == LINK_NONE {
                return Err(HeapError::OutOfMemory);
            }
            let h = self.read(cur);
            if h.size >= wanted {
                break h;
            }
            prev = Some(cur);
            cur = h.next;
        };

        match prev {
            Some(p) => {
                let mut ph = self.read(p);
                ph.next = block.next;
                self.write(p, ph);
            }
            None => self.head = block.next,
        }

        if block.size - wanted > MIN_BLOCK_SIZE {
            let rest = cur + wanted;
            self.write(
                rest,
                BlockHeader {
                    next: LINK_NONE,
                    size: block.size - wanted,
                },
            );
            block.size = wanted;
            self.insert_free(rest);
        }

        self.free_bytes -= block.size;
        self.min_ever_free = self.min_ever_free.min(self.free_bytes);

        block.size |= ALLOCATED_BIT;
        block.next = LINK_NONE;
        self.write(cur, block);

        // Safety: cur + HEADER_SIZE is inside the block just carved out.
        Ok(unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(cur + HEADER_SIZE))
        })
    }

    /// Returns a block to the free list.
    ///
    /// Freeing a pointer this region did not hand out, or freeing twice, is
    /// fatal.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if !self.initialised
            || addr < self.base_addr() + HEADER_SIZE
            || addr >= self.end_addr()
            || (addr - self.base_addr()) & ALIGN_MASK != 0
        {
            fail::die("heap: free of pointer outside region");
        }
        let off = addr - self.base_addr() - HEADER_SIZE;
        let mut h = self.read(off);
        if h.size & ALLOCATED_BIT == 0 {
            fail::die("heap: free of unallocated block");
        }
        let size = h.size & !ALLOCATED_BIT;
        if h.next != LINK_NONE
            || size < HEADER_SIZE
            || size & ALIGN_MASK != 0
            || off + size > self.len
        {
            fail::die("heap: corrupt block header");
        }

        h.size = size;
        self.write(off, h);
        self.free_bytes += size;
        self.insert_free(off);
    }

    /// Links the free block at `off` into the address-ordered list, merging
    /// with whichever neighbours it touches.
    fn insert_free(&mut self, mut off: usize) {
        let mut prev = None;
        let mut next = self.head;
        while next != LINK_NONE && next < off {
            prev = Some(next);
            next = self.read(next).next;
        }

        if let Some(p) = prev {
            let ph = self.read(p);
            if p + ph.size == off {
                let size = ph.size + self.read(off).size;
                self.write(
                    p,
                    BlockHeader {
                        next: ph.next,
                        size,
                    },
                );
                off = p;
            }
        }

        let mut block = self.read(off);
        if next != LINK_NONE && off + block.size == next {
            let nh = self.read(next);
            block.size += nh.size;
            block.next = nh.next;
        } else {
            block.next = next;
        }
        self.write(off, block);

        match prev {
            Some(p) if p == off => {}
            Some(p) => {
                let mut ph = self.read(p);
                ph.next = off;
                self.write(p, ph);
            }
            None => self.head = off,
        }
    }

    /// Calls `f(offset, size)` for each free block, lowest address first.
    pub fn for_each_free(&self, mut f: impl FnMut(usize, usize)) {
        if !self.initialised {
            f(0, self.len);
            return;
        }
        let mut cur = self.head;
        while cur != LINK_NONE {
            let h = self.read(cur);
            f(cur, h.size);
            cur = h.next;
        }
    }
}

/// The user RAM window that image heap addresses are relative to.
#[derive(Copy, Clone, Debug)]
pub struct UserRam {
    base: *mut u8,
    len: usize,
}

// Safety: like Region, UserRam describes memory owned by the heap manager.
unsafe impl Send for UserRam {}

impl UserRam {
    /// # Safety
    ///
    /// `len` bytes at `base` must be valid for reads and writes and reserved
    /// for application heaps for the life of the heap manager.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    pub fn from_static(mem: &'static mut [u8]) -> Self {
        Self {
            base: mem.as_mut_ptr(),
            len: mem.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct UserRegion {
    slot: SlotId,
    /// Heap start as stated by the image, relative to user RAM.
    heap_start: usize,
    /// Span claimed in user RAM, guard included.
    start: usize,
    end: usize,
    region: Region,
}

pub struct HeapManager {
    kernel: Region,
    ram: UserRam,
    users: [Option<UserRegion>; MAX_USER_APPS],
    /// The only slot whose tasks' allocations reach its user region.
    bound: Option<SlotId>,
    config: KernelConfig,
}

impl HeapManager {
    pub fn new(kernel: Region, ram: UserRam, config: KernelConfig) -> Self {
        Self {
            kernel,
            ram,
            users: core::array::from_fn(|_| None),
            bound: None,
            config,
        }
    }

    fn ram_end(&self) -> usize {
        self.ram.len.min(self.config.user_ram_end)
    }

    /// Binds `slot`'s user region, creating it at `heap_start` if needed.
    ///
    /// The region begins a guard's distance above `heap_start` and runs for
    /// `heap_size` bytes, or, if the image did not state a size, to the end of
    /// user RAM or the start of the next live user region, whichever is lower.
    /// Binding the same slot at the same start again keeps its existing free
    /// list.
    pub fn bind(
        &mut self,
        slot: SlotId,
        heap_start: usize,
        heap_size: Option<usize>,
    ) -> Result<(), HeapError> {
        let idx = slot.index();
        if idx >= MAX_USER_APPS {
            return Err(HeapError::BadRegion);
        }
        if let Some(u) = &self.users[idx] {
            if u.slot == slot && u.heap_start == heap_start {
                self.bound = Some(slot);
                return Ok(());
            }
        }

        let ram_end = self.ram_end();
        let start = heap_start
            .checked_add(self.config.user_heap_guard)
            .ok_or(HeapError::BadRegion)?;
        let end = match heap_size {
            Some(size) => {
                heap_start.checked_add(size).ok_or(HeapError::BadRegion)?
            }
            None => self
                .others(idx)
                .map(|u| u.start)
                .filter(|&s| s >= start)
                .fold(ram_end, usize::min),
        };
        if start >= end || end > ram_end {
            return Err(HeapError::BadRegion);
        }
        if self.others(idx).any(|u| start < u.end && u.start < end) {
            return Err(HeapError::Overlap);
        }

        // Safety: [start, end) lies inside user RAM and overlaps no other
        // live user region.
        let region = unsafe {
            Region::new(self.ram.base.wrapping_add(start), end - start)
        }
        .ok_or(HeapError::BadRegion)?;

        self.users[idx] = Some(UserRegion {
            slot,
            heap_start,
            start,
            end,
            region,
        });
        self.bound = Some(slot);
        Ok(())
    }

    /// Binds `slot`'s existing user region again, e.g. on resume.
    pub fn rebind(&mut self, slot: SlotId) -> Result<(), HeapError> {
        self.user(slot).ok_or(HeapError::NotBound)?;
        self.bound = Some(slot);
        Ok(())
    }

    /// Forgets `slot`'s user region. Its memory is not touched.
    pub fn release(&mut self, slot: SlotId) {
        let idx = slot.index();
        if idx < MAX_USER_APPS
            && self.users[idx].as_ref().is_some_and(|u| u.slot == slot)
        {
            self.users[idx] = None;
        }
        if self.bound == Some(slot) {
            self.bound = None;
        }
    }

    pub fn bound(&self) -> Option<SlotId> {
        self.bound
    }

    fn others(&self, idx: usize) -> impl Iterator<Item = &UserRegion> + '_ {
        self.users
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != idx)
            .filter_map(|(_, u)| u.as_ref())
    }

    fn user(&self, slot: SlotId) -> Option<&UserRegion> {
        self.users
            .get(slot.index())?
            .as_ref()
            .filter(|u| u.slot == slot)
    }

    fn region_mut(&mut self, id: RegionId) -> Result<&mut Region, HeapError> {
        match id {
            RegionId::Kernel => Ok(&mut self.kernel),
            RegionId::User(slot) => self
                .users
                .get_mut(slot.index())
                .and_then(|u| u.as_mut())
                .filter(|u| u.slot == slot)
                .map(|u| &mut u.region)
                .ok_or(HeapError::NotBound),
        }
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        match id {
            RegionId::Kernel => Some(&self.kernel),
            RegionId::User(slot) => self.user(slot).map(|u| &u.region),
        }
    }

    /// Picks the region for an allocation made on behalf of `task`.
    ///
    /// A forced slot, given while the kernel works on an application's
    /// behalf (its hooks, its task stacks), wins. Otherwise a kernel task gets
    /// the kernel region and an application task gets the bound user region,
    /// provided the task belongs to the bound slot.
    pub fn route(
        &self,
        task: TaskNumber,
        forced: Option<SlotId>,
    ) -> Result<RegionId, HeapError> {
        if let Some(slot) = forced {
            return self
                .user(slot)
                .map(|_| RegionId::User(slot))
                .ok_or(HeapError::NotBound);
        }
        match task.owner() {
            Owner::Kernel => Ok(RegionId::Kernel),
            Owner::Slot(idx) => self
                .bound
                .filter(|b| b.index() == idx)
                .map(RegionId::User)
                .ok_or(HeapError::NotBound),
        }
    }

    pub fn allocate(
        &mut self,
        id: RegionId,
        size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        self.region_mut(id)?.allocate(size)
    }

    /// Frees `ptr` back to the region named. Fatal if it is not from there.
    pub fn free(&mut self, id: RegionId, ptr: NonNull<u8>) {
        match self.region_mut(id) {
            Ok(r) => r.free(ptr),
            Err(_) => fail::die("heap: free into unbound region"),
        }
    }

    /// Finds the region `ptr` was allocated from.
    pub fn region_of(&self, ptr: NonNull<u8>) -> Option<RegionId> {
        let addr = ptr.as_ptr() as usize;
        if self.kernel.contains(addr) {
            return Some(RegionId::Kernel);
        }
        self.users
            .iter()
            .flatten()
            .find(|u| u.region.contains(addr))
            .map(|u| RegionId::User(u.slot))
    }

    /// Frees `ptr` to whichever region contains it.
    pub fn free_by_address(&mut self, ptr: NonNull<u8>) {
        match self.region_of(ptr) {
            Some(id) => self.free(id, ptr),
            None => fail::die("heap: free of pointer outside every region"),
        }
    }

    pub fn free_bytes(&self, id: RegionId) -> usize {
        self.region(id).map_or(0, Region::free_bytes)
    }

    pub fn min_ever_free(&self, id: RegionId) -> usize {
        self.region(id).map_or(0, Region::min_ever_free)
    }
}

/// Memory a scheduler uses for task stacks and control blocks.
pub trait TaskMemory {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError>;
    fn free(&mut self, ptr: NonNull<u8>);
}

/// Allocates from one chosen region and frees by address.
pub struct RoutedHeap<'a> {
    heap: &'a mut HeapManager,
    region: RegionId,
}

impl<'a> RoutedHeap<'a> {
    pub fn new(heap: &'a mut HeapManager, region: RegionId) -> Self {
        Self { heap, region }
    }
}

impl TaskMemory for RoutedHeap<'_> {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.allocate(self.region, size)
    }

    fn free(&mut self, ptr: NonNull<u8>) {
        self.heap.free_by_address(ptr)
    }
}
