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

//! Memory-mapping system calls.
//!
//! These wrappers stand between untrusted user arguments and the virtual
//! memory area manager: every argument is validated here and rejected with an
//! error code, so the manager's overlap panic (a kernel invariant violation)
//! is unreachable from user input.

use crate::{
	errno::{EResult, EINVAL, ENOMEM},
	memory::{
		buddy::GfpFlags,
		vmem::MapFlags,
		MemoryCore, VirtAddr, PAGE_SIZE,
	},
	process::mem_space::MemSpace,
};

/// Maps `length` bytes of anonymous memory into `mm`.
///
/// `addr` is a hint: when non-null, page-aligned and free, the mapping is
/// placed there; otherwise the first large enough gap is used. The mapping is
/// created user-accessible with the protection in `prot`.
///
/// On success, returns the address of the mapping. Returns `EINVAL` on
/// malformed arguments and `ENOMEM` when no address range or no memory is
/// available.
pub fn sys_mmap(
	core: &mut MemoryCore,
	mm: &mut MemSpace,
	addr: VirtAddr,
	length: usize,
	prot: MapFlags,
) -> EResult<VirtAddr> {
	if length == 0 {
		return Err(EINVAL);
	}
	if !addr.is_null() && !addr.is_aligned_to(PAGE_SIZE) {
		return Err(EINVAL);
	}
	let pages = length.div_ceil(PAGE_SIZE);
	let start = if !addr.is_null()
		&& mm
			.is_valid_vm_area(addr, addr + pages * PAGE_SIZE)
			.unwrap_or(false)
	{
		addr
	} else {
		mm.find_free_vm_area(length).ok_or(ENOMEM)?
	};
	let pgflags = (prot & (MapFlags::RW | MapFlags::USER)) | MapFlags::PRESENT | MapFlags::USER;
	mm.create_vm_area(core, start, length, pgflags, GfpFlags::USER)
		.map_err(|_| ENOMEM)?;
	Ok(start)
}

/// Unmaps the mapping starting at `addr` from `mm`.
///
/// `addr` must be the exact start of a mapping previously returned by
/// [`sys_mmap`]; anything else is rejected with `EINVAL`.
pub fn sys_munmap(core: &mut MemoryCore, mm: &mut MemSpace, addr: VirtAddr) -> EResult<()> {
	if !addr.is_aligned_to(PAGE_SIZE) {
		return Err(EINVAL);
	}
	mm.destroy_vm_area(core, addr).map_err(|_| EINVAL)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::mem_space::{create_blank_process_image, destroy_process_image};

	#[test]
	fn mmap_munmap() {
		let mut core = MemoryCore::new(1024, 1024);
		let mut mm = create_blank_process_image(&mut core, 0x4000).unwrap();
		// Honored hint
		let addr = sys_mmap(
			&mut core,
			&mut mm,
			VirtAddr(0x08000000),
			0x2000,
			MapFlags::RW,
		)
		.unwrap();
		assert_eq!(addr, VirtAddr(0x08000000));
		assert_eq!(mm.map_count(), 2);
		// Overlapping hint is relocated instead of panicking
		let other = sys_mmap(
			&mut core,
			&mut mm,
			VirtAddr(0x08001000),
			0x1000,
			MapFlags::RW,
		)
		.unwrap();
		assert_ne!(other, VirtAddr(0x08001000));
		// Unmapping releases the exact mapping
		sys_munmap(&mut core, &mut mm, addr).unwrap();
		sys_munmap(&mut core, &mut mm, other).unwrap();
		assert_eq!(mm.map_count(), 1);
		destroy_process_image(&mut core, mm);
	}

	#[test]
	fn mmap_bad_arguments() {
		let mut core = MemoryCore::new(1024, 1024);
		let mut mm = create_blank_process_image(&mut core, 0x4000).unwrap();
		assert_eq!(
			sys_mmap(&mut core, &mut mm, VirtAddr(0x08000000), 0, MapFlags::RW),
			Err(EINVAL)
		);
		assert_eq!(
			sys_mmap(&mut core, &mut mm, VirtAddr(0x08000123), 0x1000, MapFlags::RW),
			Err(EINVAL)
		);
		assert_eq!(
			sys_munmap(&mut core, &mut mm, VirtAddr(0x08000123)),
			Err(EINVAL)
		);
		// No mapping at this address
		assert_eq!(
			sys_munmap(&mut core, &mut mm, VirtAddr(0x08000000)),
			Err(EINVAL)
		);
		destroy_process_image(&mut core, mm);
	}

	#[test]
	fn mmap_null_hint_uses_first_fit() {
		let mut core = MemoryCore::new(1024, 1024);
		let mut mm = create_blank_process_image(&mut core, 0x4000).unwrap();
		let addr = sys_mmap(&mut core, &mut mm, VirtAddr(0), 0x3000, MapFlags::RW).unwrap();
		assert!(!addr.is_null());
		let vma = mm.find_vm_area(addr).unwrap();
		assert_eq!(vma.size(), 0x3000);
		sys_munmap(&mut core, &mut mm, addr).unwrap();
		destroy_process_image(&mut core, mm);
	}
}
