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

//! Memory usage statistics.

use crate::memory::MemoryCore;
use core::fmt;

/// A snapshot of the system's memory usage, in pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemInfo {
	/// The total number of managed pages.
	pub mem_total: usize,
	/// The number of free pages.
	pub mem_free: usize,
	/// The number of allocated pages.
	pub mem_used: usize,
	/// The number of pages held by slab caches.
	pub slab: usize,
}

impl fmt::Display for MemInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"MemTotal: {} kB, MemFree: {} kB, Slab: {} kB",
			self.mem_total * 4,
			self.mem_free * 4,
			self.slab * 4
		)
	}
}

impl MemoryCore {
	/// Returns a snapshot of the memory usage.
	pub fn mem_info(&self) -> MemInfo {
		let mem_total = self.frames.total_pages();
		let mem_used = self.frames.allocated_pages_count();
		MemInfo {
			mem_total,
			mem_free: mem_total - mem_used,
			mem_used,
			slab: self.caches.pages(),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::buddy::GfpFlags;

	#[test]
	fn meminfo() {
		let mut core = MemoryCore::new(256, 256);
		let info = core.mem_info();
		assert_eq!(info.mem_total, 512);
		assert_eq!(info.mem_free + info.mem_used, info.mem_total);
		// The kernel directory and window tables live in slab pages
		assert!(info.slab > 0);
		let before = core.mem_info();
		let p = core.alloc_pages(1, GfpFlags::KERNEL).unwrap();
		assert_eq!(core.mem_info().mem_used, before.mem_used + 2);
		core.free_pages(p);
		assert_eq!(core.mem_info(), before);
	}
}
