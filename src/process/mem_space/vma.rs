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

//! A virtual memory area is a region of virtual memory that a process can
//! access.
//!
//! Areas may be created at the process's creation or by the process itself
//! using system calls.

use crate::memory::{vmem::MapFlags, VirtAddr, PAGE_SIZE};
use core::fmt;

/// A virtual memory area: the half-open range `[vm_start, vm_end)` with its
/// protection flags.
#[derive(Clone)]
pub struct VmArea {
	/// Address of the beginning of the area.
	pub vm_start: VirtAddr,
	/// Address of the first byte after the area.
	pub vm_end: VirtAddr,
	/// The area's protection flags.
	pub flags: MapFlags,
}

impl VmArea {
	/// Creates a new instance.
	///
	/// Both addresses must be page-aligned, with `vm_start` strictly below
	/// `vm_end`.
	pub fn new(vm_start: VirtAddr, vm_end: VirtAddr, flags: MapFlags) -> Self {
		debug_assert!(vm_start.is_aligned_to(PAGE_SIZE));
		debug_assert!(vm_end.is_aligned_to(PAGE_SIZE));
		debug_assert!(vm_start < vm_end);
		Self {
			vm_start,
			vm_end,
			flags,
		}
	}

	/// Returns the size of the area in bytes.
	#[inline]
	pub fn size(&self) -> usize {
		self.vm_end - self.vm_start
	}

	/// Returns the size of the area in pages.
	#[inline]
	pub fn pages(&self) -> usize {
		self.size() / PAGE_SIZE
	}

	/// Tells whether the area contains the address `addr`.
	#[inline]
	pub fn contains(&self, addr: VirtAddr) -> bool {
		(self.vm_start..self.vm_end).contains(&addr)
	}

	/// Tells whether the area intersects the half-open range `[start, end)`.
	#[inline]
	pub fn intersects(&self, start: VirtAddr, end: VirtAddr) -> bool {
		self.vm_start < end && start < self.vm_end
	}
}

impl fmt::Debug for VmArea {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"VmArea {{ start: {:?}, end: {:?}, flags: {:?} }}",
			self.vm_start, self.vm_end, self.flags
		)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn queries() {
		let vma = VmArea::new(
			VirtAddr(0x1000),
			VirtAddr(0x4000),
			MapFlags::PRESENT | MapFlags::RW,
		);
		assert_eq!(vma.size(), 0x3000);
		assert_eq!(vma.pages(), 3);
		assert!(vma.contains(VirtAddr(0x1000)));
		assert!(vma.contains(VirtAddr(0x3fff)));
		assert!(!vma.contains(VirtAddr(0x4000)));
		assert!(vma.intersects(VirtAddr(0x3000), VirtAddr(0x5000)));
		assert!(!vma.intersects(VirtAddr(0x4000), VirtAddr(0x5000)));
		assert!(!vma.intersects(VirtAddr(0x0), VirtAddr(0x1000)));
	}
}
