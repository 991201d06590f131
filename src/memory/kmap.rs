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

//! Transient kernel mappings.
//!
//! The window between [`KMAP_BEGIN`] and [`KMAP_END`] holds short-lived
//! kernel mappings of arbitrary frames. It is used to zero freshly allocated
//! frames and to copy between frames. The page tables backing the window are
//! materialized once at boot and marked global, so every page directory
//! (which starts as a byte-wise copy of the kernel directory) shares them: a
//! mapping installed in the window is visible no matter which directory is
//! bound.
//!
//! Unmapping a slot invalidates its TLB entry; without it, the next user of
//! the slot would read or write through the previous translation.

use crate::{
	errno::{AllocError, AllocResult},
	memory::{
		buddy::FrameOrder,
		vmem::MapFlags,
		MemoryCore, PhysAddr, VirtAddr, KMAP_BEGIN, KMAP_END, PAGE_SIZE,
	},
};
use super::vmem::x86::ENTRIES_PER_TABLE;

/// The number of slots in the window.
const KMAP_SLOTS: usize = 16;

/// Slot usage of the transient mapping window.
pub(crate) struct KmapWindow {
	used: [bool; KMAP_SLOTS],
}

impl KmapWindow {
	pub fn new() -> Self {
		Self {
			used: [false; KMAP_SLOTS],
		}
	}
}

impl MemoryCore {
	/// Materializes the page tables of the window in the kernel directory.
	///
	/// This must run before the first directory copy so every address space
	/// shares the same tables.
	pub(crate) fn kmap_init(&mut self) -> AllocResult<()> {
		let pgd = self.kernel_directory();
		let mut va = KMAP_BEGIN;
		while va < KMAP_END {
			self.upd_vm_area(
				pgd,
				va,
				PhysAddr(0),
				PAGE_SIZE,
				MapFlags::GLOBAL | MapFlags::UPD_ADDR,
			)?;
			va = va + ENTRIES_PER_TABLE * PAGE_SIZE;
		}
		Ok(())
	}

	/// Maps the frame at `frame` into a free slot of the window and returns
	/// the slot's virtual address.
	pub fn kmap(&mut self, frame: PhysAddr) -> AllocResult<VirtAddr> {
		debug_assert!(frame.is_aligned_to(PAGE_SIZE));
		let slot = self
			.kmap
			.used
			.iter()
			.position(|used| !used)
			.ok_or(AllocError)?;
		self.kmap.used[slot] = true;
		let va = KMAP_BEGIN + slot * PAGE_SIZE;
		let pgd = self.kernel_directory();
		self.upd_vm_area(
			pgd,
			va,
			frame,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::RW | MapFlags::GLOBAL | MapFlags::UPD_ADDR,
		)?;
		Ok(va)
	}

	/// Removes the mapping at `va` and releases its slot.
	pub fn kunmap(&mut self, va: VirtAddr) {
		debug_assert!((KMAP_BEGIN..KMAP_END).contains(&va));
		let slot = (va - KMAP_BEGIN) / PAGE_SIZE;
		debug_assert!(self.kmap.used[slot]);
		let pgd = self.kernel_directory();
		self.clear_entry(pgd, va);
		self.kmap.used[slot] = false;
	}

	/// Zeroes the block of `2^order` frames at `frame`, writing through
	/// transient mappings.
	pub(crate) fn zero_frame(&mut self, frame: PhysAddr, order: FrameOrder) {
		for page in 0..(1usize << order) {
			let pa = frame + page * PAGE_SIZE;
			let va = self.kmap(pa).expect("transient mapping window exhausted");
			let dst = self
				.translate(va, true, false)
				.expect("transient mapping not present");
			debug_assert_eq!(dst, pa);
			self.frames.fill(dst, PAGE_SIZE, 0);
			self.kunmap(va);
		}
	}

	/// Copies one frame from `src` to `dst` through transient mappings.
	pub(crate) fn copy_frame(&mut self, dst: PhysAddr, src: PhysAddr) {
		let dst_va = self.kmap(dst).expect("transient mapping window exhausted");
		let src_va = self.kmap(src).expect("transient mapping window exhausted");
		let to = self
			.translate(dst_va, true, false)
			.expect("transient mapping not present");
		let from = self
			.translate(src_va, false, false)
			.expect("transient mapping not present");
		self.frames.copy_page(to, from);
		self.kunmap(src_va);
		self.kunmap(dst_va);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::buddy::GfpFlags;

	#[test]
	fn kmap_zero_copy() {
		let mut core = MemoryCore::new(512, 512);
		let a = core.alloc_pages(0, GfpFlags::USER).unwrap();
		let b = core.alloc_pages(0, GfpFlags::USER).unwrap();
		core.frames.fill(a, PAGE_SIZE, 0xaa);
		core.frames.fill(b, PAGE_SIZE, 0xbb);
		core.zero_frame(a, 0);
		assert!(core.frames.slice(a, PAGE_SIZE).iter().all(|b| *b == 0));
		core.copy_frame(a, b);
		assert!(core.frames.slice(a, PAGE_SIZE).iter().all(|b| *b == 0xbb));
		core.free_pages(a);
		core.free_pages(b);
	}

	#[test]
	fn kmap_slot_reuse() {
		let mut core = MemoryCore::new(512, 512);
		let a = core.alloc_pages(0, GfpFlags::USER).unwrap();
		let b = core.alloc_pages(0, GfpFlags::USER).unwrap();
		core.frames.fill(a, PAGE_SIZE, 1);
		core.frames.fill(b, PAGE_SIZE, 2);
		// The first slot is handed out again after unmap, and the stale
		// translation must be gone with it
		let va_a = core.kmap(a).unwrap();
		assert_eq!(core.translate(va_a, false, false), Ok(a));
		core.kunmap(va_a);
		let va_b = core.kmap(b).unwrap();
		assert_eq!(va_a, va_b);
		assert_eq!(core.translate(va_b, false, false), Ok(b));
		core.kunmap(va_b);
		core.free_pages(a);
		core.free_pages(b);
	}
}
