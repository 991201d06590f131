/*
 * Copyright 2025 The MentOS developers
 *
 * This file is part of MentOS.
 *
 * MentOS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * MentOS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * MentOS. If not, see <https://www.gnu.org/licenses/>.
 */

//! x86 virtual memory works with a tree structure. Each element is an array
//! of sub-elements. The position of the elements in the arrays allows to tell
//! the virtual address for the mapping.
//!
//! Under 32 bits, elements are arrays of 32 bits long words that can contain
//! 1024 entries:
//! - Page directory: the main element, contains page tables
//! - Page table: represents a block of 4 MB, each entry is a page
//!
//! Each entry contains the physical address of the element/page and some
//! flags. The flags can be stored with the address in only 4 bytes large
//! entries because addresses have to be page-aligned, freeing 12 bits in the
//! entry for the flags. Bits 9 to 11 are ignored by the hardware and hold
//! software state: the copy-on-write mark and the allocated-by-us marker.
//!
//! This module also models the MMU itself: the `cr2`/`cr3` registers and the
//! TLB. Translation consults the TLB first and fills it from the page tables
//! on a miss, so a page-table update that is not followed by the single-entry
//! invalidation leaves a stale translation behind, exactly as on the real
//! hardware.

use crate::memory::{buddy::FrameAllocator, PhysAddr, VirtAddr, PAGE_SIZE};
use alloc::collections::BTreeMap;

/// Paging entry.
pub type Entry = u32;

/// **x86 paging flag**: If set, prevents the CPU from evicting the associated
/// translation when the TLB is flushed.
pub const FLAG_GLOBAL: Entry = 0b100000000;
/// **x86 paging flag**: If set, pages are 4 MB long.
pub const FLAG_PAGE_SIZE: Entry = 0b010000000;
/// **x86 paging flag**: Indicates that the page has been written.
pub const FLAG_DIRTY: Entry = 0b001000000;
/// **x86 paging flag**: Set if the page has been read or written.
pub const FLAG_ACCESSED: Entry = 0b000100000;
/// **x86 paging flag**: If set, the page can be accessed by userspace
/// operations.
pub const FLAG_USER: Entry = 0b000000100;
/// **x86 paging flag**: If set, the page can be written.
pub const FLAG_WRITE: Entry = 0b000000010;
/// **x86 paging flag**: If set, the page is present.
pub const FLAG_PRESENT: Entry = 0b000000001;

/// **Software flag** in an ignored bit: the mapping is copy-on-write. Paired
/// with a clear present bit, the slot is to be populated lazily.
pub const FLAG_COW: Entry = 1 << 9;
/// **Software flag** in an ignored bit: the table pointed to by a directory
/// entry was allocated by the kernel and may be reclaimed.
pub const FLAG_AVAILABLE: Entry = 1 << 10;

/// Flags mask in a paging entry.
pub const FLAGS_MASK: Entry = 0xfff;
/// Address mask in a paging entry. The address doesn't need every bit since
/// it must be page-aligned.
pub const ADDR_MASK: Entry = !FLAGS_MASK;

/// x86 page fault flag. If set, the page was present and the fault is a
/// protection violation rather than a non-present access.
pub const PAGE_FAULT_PRESENT: u32 = 0b001;
/// x86 page fault flag. If set, the fault was caused by a write operation,
/// else by a read operation.
pub const PAGE_FAULT_WRITE: u32 = 0b010;
/// x86 page fault flag. If set, the fault was caused by a userspace
/// operation.
pub const PAGE_FAULT_USER: u32 = 0b100;

/// The number of entries in a table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// The number of tables reserved for the userspace.
///
/// Those tables start at the beginning of the page directory. Remaining
/// tables are reserved for the kernel.
pub const USERSPACE_TABLES: usize = 768;

/// Returns the index of the entry corresponding to the given virtual address
/// `addr` for the element at level `level` in the tree.
///
/// The level represents the depth in the tree. `0` is the deepest.
#[inline]
pub fn entry_index(addr: VirtAddr, level: usize) -> usize {
	(addr.0 >> (12 + level * 10)) & 0x3ff
}

/// Turns the given address/flags pair into a paging entry.
#[inline]
pub fn to_entry(addr: PhysAddr, flags: Entry) -> Entry {
	debug_assert!(addr.is_aligned_to(PAGE_SIZE));
	addr.0 as Entry | (flags & FLAGS_MASK)
}

/// Returns the physical address stored in the entry.
#[inline]
pub fn entry_addr(entry: Entry) -> PhysAddr {
	PhysAddr((entry & ADDR_MASK) as usize)
}

/// Reads the entry at `index` of the table at physical address `table`.
pub(crate) fn read_entry(frames: &FrameAllocator, table: PhysAddr, index: usize) -> Entry {
	debug_assert!(index < ENTRIES_PER_TABLE);
	let bytes = frames.slice(table + index * 4, 4);
	Entry::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Writes `value` to the entry at `index` of the table at physical address
/// `table`.
///
/// The corresponding TLB entry must be invalidated afterwards.
pub(crate) fn write_entry(
	frames: &mut FrameAllocator,
	table: PhysAddr,
	index: usize,
	value: Entry,
) {
	debug_assert!(index < ENTRIES_PER_TABLE);
	frames
		.slice_mut(table + index * 4, 4)
		.copy_from_slice(&value.to_ne_bytes());
}

/// A page fault raised by a failed translation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageFault {
	/// The faulting virtual address.
	pub addr: VirtAddr,
	/// The hardware error code (see the `PAGE_FAULT_*` flags).
	pub code: u32,
}

/// The MMU: control registers and the TLB.
pub(crate) struct Mmu {
	/// Physical address of the bound page directory.
	cr3: PhysAddr,
	/// Virtual address of the last fault.
	cr2: VirtAddr,
	/// Cached translations, keyed by page virtual address. Values are the
	/// page-table entries observed at fill time.
	tlb: BTreeMap<VirtAddr, Entry>,
}

impl Mmu {
	pub fn new() -> Self {
		Self {
			cr3: PhysAddr(0),
			cr2: VirtAddr(0),
			tlb: BTreeMap::new(),
		}
	}

	/// Binds the page directory at `pgd`.
	///
	/// Rebinding flushes every non-global translation.
	pub fn bind(&mut self, pgd: PhysAddr) {
		if self.cr3 != pgd {
			self.cr3 = pgd;
			self.flush();
		}
	}

	/// Tells whether the page directory at `pgd` is bound.
	#[inline]
	pub fn is_bound(&self, pgd: PhysAddr) -> bool {
		self.cr3 == pgd
	}

	/// Returns the physical address of the bound page directory.
	#[inline]
	pub fn current(&self) -> PhysAddr {
		self.cr3
	}

	/// Returns the virtual address whose translation faulted last.
	#[inline]
	pub fn fault_address(&self) -> VirtAddr {
		self.cr2
	}

	/// Invalidates the translation of the page at `addr`.
	pub fn invlpg(&mut self, addr: VirtAddr) {
		self.tlb.remove(&addr.down_align_to(PAGE_SIZE));
	}

	/// Flushes the TLB. Global translations survive.
	pub fn flush(&mut self) {
		self.tlb.retain(|_, entry| *entry & FLAG_GLOBAL != 0);
	}

	/// Returns the cached translation of the page at `addr`, if any.
	pub fn tlb_lookup(&self, addr: VirtAddr) -> Option<Entry> {
		self.tlb.get(&addr.down_align_to(PAGE_SIZE)).copied()
	}

	fn fault(&mut self, addr: VirtAddr, present: bool, write: bool, user: bool) -> PageFault {
		let mut code = 0;
		if present {
			code |= PAGE_FAULT_PRESENT;
		}
		if write {
			code |= PAGE_FAULT_WRITE;
		}
		if user {
			code |= PAGE_FAULT_USER;
		}
		self.cr2 = addr;
		PageFault { addr, code }
	}

	/// Translates `addr` for an access of the given kind, through the TLB.
	///
	/// On success, the accessed and (for writes) dirty bits are set in the
	/// page tables and the translation is cached. On failure, `cr2` is loaded
	/// with `addr` and a fault with the hardware error code is returned.
	pub fn translate(
		&mut self,
		frames: &mut FrameAllocator,
		addr: VirtAddr,
		write: bool,
		user: bool,
	) -> Result<PhysAddr, PageFault> {
		let page = addr.down_align_to(PAGE_SIZE);
		let offset = addr.0 & (PAGE_SIZE - 1);
		if let Some(entry) = self.tlb_lookup(page) {
			debug_assert!(entry & FLAG_PRESENT != 0);
			if user && entry & FLAG_USER == 0 {
				return Err(self.fault(addr, true, write, user));
			}
			if write && entry & FLAG_WRITE == 0 {
				return Err(self.fault(addr, true, write, user));
			}
			// A write through a clean cached translation walks the tables
			// again so the dirty bit gets set
			if !write || entry & FLAG_DIRTY != 0 {
				return Ok(entry_addr(entry) + offset);
			}
		}
		// First level
		let pd_index = entry_index(addr, 1);
		let pde = read_entry(frames, self.cr3, pd_index);
		if pde & FLAG_PRESENT == 0 {
			return Err(self.fault(addr, false, write, user));
		}
		debug_assert!(pde & FLAG_PAGE_SIZE == 0);
		if user && pde & FLAG_USER == 0 {
			return Err(self.fault(addr, true, write, user));
		}
		// Second level
		let table = entry_addr(pde);
		let pt_index = entry_index(addr, 0);
		let pte = read_entry(frames, table, pt_index);
		if pte & FLAG_PRESENT == 0 {
			return Err(self.fault(addr, false, write, user));
		}
		if user && pte & FLAG_USER == 0 {
			return Err(self.fault(addr, true, write, user));
		}
		if write && pte & FLAG_WRITE == 0 {
			return Err(self.fault(addr, true, write, user));
		}
		// Accessed/dirty bookkeeping, then fill the TLB
		write_entry(frames, self.cr3, pd_index, pde | FLAG_ACCESSED);
		let mut pte = pte | FLAG_ACCESSED;
		if write {
			pte |= FLAG_DIRTY;
		}
		write_entry(frames, table, pt_index, pte);
		self.tlb.insert(page, pte);
		Ok(entry_addr(pte) + offset)
	}
}
