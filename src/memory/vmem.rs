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

//! The page-table walker.
//!
//! The walker mutates two-level page tables in an arch-independent manner:
//! it materializes directory entries on demand from the table slab cache,
//! widens directory permissions monotonically, writes leaf entries, and
//! invalidates the TLB entry after every write, as the hardware requires.
//!
//! Copy-on-write state is carried in the leaf entries themselves (see
//! [`x86::FLAG_COW`]). When a lazy slot is cloned, the destination must
//! remember which source slot to resolve from; rather than hiding a pointer
//! inside the non-present hardware entry, the link is kept in a shadow table
//! on the side ([`MemoryCore::cow_links`]) and the hardware entry stays
//! plainly non-present.

pub mod x86;

use crate::{
	errno::AllocResult,
	memory::{
		buddy::{get_block_size, GfpFlags},
		MemoryCore, PhysAddr, VirtAddr, PAGE_SIZE,
	},
};
use x86::{
	entry_addr, entry_index, read_entry, to_entry, write_entry, Entry, PageFault, ADDR_MASK,
	ENTRIES_PER_TABLE, FLAGS_MASK, FLAG_AVAILABLE, FLAG_COW, FLAG_GLOBAL, FLAG_PAGE_SIZE,
	FLAG_PRESENT, FLAG_USER, FLAG_WRITE,
};

bitflags::bitflags! {
	/// Mapping-request flags, translated into hardware entry bits by the
	/// walker.
	pub struct MapFlags: u32 {
		/// The mapping is present.
		const PRESENT = 1 << 0;
		/// The mapping is writable.
		const RW = 1 << 1;
		/// The mapping is accessible from userspace.
		const USER = 1 << 2;
		/// The mapping survives TLB flushes and is shared by every address
		/// space.
		const GLOBAL = 1 << 3;
		/// The mapping is copy-on-write: shared read-only if present,
		/// populated lazily if not.
		const COW = 1 << 4;
		/// The walker writes successive physical frame numbers while
		/// iterating. Without this flag, only the flag bits are rewritten.
		const UPD_ADDR = 1 << 5;
	}
}

/// Translates mapping-request flags into leaf entry bits.
fn hw_flags(flags: MapFlags) -> Entry {
	let mut out = 0;
	if flags.contains(MapFlags::PRESENT) {
		out |= FLAG_PRESENT;
	}
	if flags.contains(MapFlags::RW) {
		out |= FLAG_WRITE;
	}
	if flags.contains(MapFlags::USER) {
		out |= FLAG_USER;
	}
	if flags.contains(MapFlags::GLOBAL) {
		out |= FLAG_GLOBAL;
	}
	if flags.contains(MapFlags::COW) {
		out |= FLAG_COW;
	}
	out
}

/// Translates mapping-request flags into directory entry bits.
///
/// Directory entries are always present and writable; the effective
/// permission is decided at the leaf.
fn hw_dir_flags(flags: MapFlags) -> Entry {
	let mut out = FLAG_PRESENT | FLAG_WRITE | FLAG_AVAILABLE;
	if flags.contains(MapFlags::USER) {
		out |= FLAG_USER;
	}
	if flags.contains(MapFlags::GLOBAL) {
		out |= FLAG_GLOBAL;
	}
	out
}

/// Transient cursor over the leaf entries covering a virtual range.
///
/// The cursor materializes every directory entry it crosses (allocating the
/// table if needed) and yields the location of successive leaf entries. The
/// current table is cached so only one directory lookup is paid per table.
struct PageWalker {
	pgd: PhysAddr,
	next: VirtAddr,
	end: VirtAddr,
	flags: MapFlags,
	table: Option<(PhysAddr, usize)>,
}

impl PageWalker {
	fn new(pgd: PhysAddr, virt: VirtAddr, size: usize, flags: MapFlags) -> Self {
		debug_assert!(virt.is_aligned_to(PAGE_SIZE));
		Self {
			pgd,
			next: virt,
			end: virt + size.div_ceil(PAGE_SIZE) * PAGE_SIZE,
			flags,
			table: None,
		}
	}

	/// Advances to the next page, returning its `(table, index, address)`.
	fn next(&mut self, core: &mut MemoryCore) -> AllocResult<Option<(PhysAddr, usize, VirtAddr)>> {
		if self.next >= self.end {
			return Ok(None);
		}
		let va = self.next;
		self.next = va + PAGE_SIZE;
		let dir_index = entry_index(va, 1);
		let table = match self.table {
			Some((table, index)) if index == dir_index => table,
			_ => {
				let table = core.ensure_table(self.pgd, va, self.flags)?;
				self.table = Some((table, dir_index));
				table
			}
		};
		Ok(Some((table, entry_index(va, 0), va)))
	}
}

impl MemoryCore {
	/// Allocates a zeroed page-table page from the table slab.
	pub(crate) fn alloc_table(&mut self) -> AllocResult<PhysAddr> {
		let va = self
			.caches
			.alloc(&mut self.frames, self.table_cache, GfpFlags::KERNEL)?;
		let pa = va.kernel_to_physical().unwrap();
		self.frames.fill(pa, PAGE_SIZE, 0);
		Ok(pa)
	}

	/// Returns a page-table page to the table slab.
	pub(crate) fn free_table(&mut self, pa: PhysAddr) {
		self.caches
			.free(&mut self.frames, pa.kernel_to_virtual().unwrap());
	}

	/// Returns the directory entry covering `va` in the directory `pgd`.
	pub(crate) fn dir_entry(&self, pgd: PhysAddr, va: VirtAddr) -> Entry {
		read_entry(&self.frames, pgd, entry_index(va, 1))
	}

	/// Returns the location `(table, index)` of the leaf entry for `va`, if
	/// its directory entry is present.
	pub(crate) fn locate_entry(&self, pgd: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, usize)> {
		let pde = self.dir_entry(pgd, va);
		if pde & FLAG_PRESENT == 0 {
			return None;
		}
		debug_assert!(pde & FLAG_PAGE_SIZE == 0);
		Some((entry_addr(pde), entry_index(va, 0)))
	}

	/// Returns the leaf entry for `va` in the directory `pgd`, present or
	/// not, if its directory entry is present.
	pub(crate) fn pte_of(&self, pgd: PhysAddr, va: VirtAddr) -> Option<Entry> {
		let (table, index) = self.locate_entry(pgd, va)?;
		Some(read_entry(&self.frames, table, index))
	}

	/// Writes the leaf entry for `va` and invalidates its TLB entry.
	pub(crate) fn set_pte(&mut self, pgd: PhysAddr, va: VirtAddr, entry: Entry) {
		let (table, index) = self
			.locate_entry(pgd, va)
			.expect("page table missing for entry update");
		write_entry(&mut self.frames, table, index, entry);
		self.mmu.invlpg(va);
	}

	/// Clears the leaf entry for `va`, if materialized, and invalidates its
	/// TLB entry.
	pub(crate) fn clear_entry(&mut self, pgd: PhysAddr, va: VirtAddr) {
		if let Some((table, index)) = self.locate_entry(pgd, va) {
			write_entry(&mut self.frames, table, index, 0);
		}
		self.mmu.invlpg(va);
	}

	/// Returns the page table covering `va` in the directory `pgd`,
	/// materializing it if needed.
	///
	/// A new table page is allocated zeroed from the table slab and its
	/// directory entry gets `{present, rw, user?, global?, available}`. An
	/// existing entry has `present`, `rw` and `user` widened monotonically;
	/// the `global` bit is one-way: once a table is installed globally,
	/// subsequent requests must match.
	fn ensure_table(
		&mut self,
		pgd: PhysAddr,
		va: VirtAddr,
		flags: MapFlags,
	) -> AllocResult<PhysAddr> {
		let index = entry_index(va, 1);
		let pde = read_entry(&self.frames, pgd, index);
		if pde & FLAG_PRESENT == 0 {
			let table = self.alloc_table()?;
			write_entry(&mut self.frames, pgd, index, to_entry(table, hw_dir_flags(flags)));
			return Ok(table);
		}
		debug_assert!(pde & FLAG_PAGE_SIZE == 0);
		if pde & FLAG_GLOBAL != 0 {
			debug_assert!(
				flags.contains(MapFlags::GLOBAL),
				"non-global mapping request over a global page table"
			);
		}
		let widened =
			pde | (hw_dir_flags(flags) & (FLAG_PRESENT | FLAG_WRITE | FLAG_USER | FLAG_GLOBAL));
		if widened != pde {
			write_entry(&mut self.frames, pgd, index, widened);
		}
		Ok(entry_addr(pde))
	}

	/// Updates the mapping of the virtual range `[virt, virt + size)` in the
	/// directory `pgd`.
	///
	/// For every page of the range: if [`MapFlags::UPD_ADDR`] is set, the
	/// leaf entry receives the successive physical frame starting at `phys`;
	/// the permission and copy-on-write bits derived from `flags` are always
	/// written. After each write, the TLB entry for the page is invalidated.
	pub fn upd_vm_area(
		&mut self,
		pgd: PhysAddr,
		virt: VirtAddr,
		phys: PhysAddr,
		size: usize,
		flags: MapFlags,
	) -> AllocResult<()> {
		debug_assert!(phys.is_aligned_to(PAGE_SIZE));
		let mut walker = PageWalker::new(pgd, virt, size, flags);
		while let Some((table, index, va)) = walker.next(self)? {
			let old = read_entry(&self.frames, table, index);
			let addr_bits = if flags.contains(MapFlags::UPD_ADDR) {
				(phys + (va - virt)).0 as Entry & ADDR_MASK
			} else {
				old & ADDR_MASK
			};
			write_entry(&mut self.frames, table, index, addr_bits | hw_flags(flags));
			self.mmu.invlpg(va);
		}
		Ok(())
	}

	/// Clones the mapping of the virtual range `[virt, virt + size)` from the
	/// directory `src_pgd` into the directory `dst_pgd`, walking both in
	/// lockstep.
	///
	/// A lazy source slot (copy-on-write, not present) makes the destination
	/// a lazy indirection: the hardware entry stays non-present with the
	/// copy-on-write mark, and the shadow table records the source slot the
	/// fault handler must resolve from. Any other source slot has its frame
	/// number copied and `flags` applied. Either way the destination TLB
	/// entry is invalidated.
	pub fn clone_vm_area(
		&mut self,
		src_pgd: PhysAddr,
		dst_pgd: PhysAddr,
		virt: VirtAddr,
		size: usize,
		flags: MapFlags,
	) -> AllocResult<()> {
		let mut walker = PageWalker::new(dst_pgd, virt, size, flags);
		while let Some((table, index, va)) = walker.next(self)? {
			let src = self.pte_of(src_pgd, va).unwrap_or(0);
			let entry = if src == 0 {
				0
			} else if src & FLAG_COW != 0 && src & FLAG_PRESENT == 0 {
				self.cow_links.insert((dst_pgd, va), (src_pgd, va));
				src & FLAGS_MASK
			} else {
				(src & ADDR_MASK) | hw_flags(flags)
			};
			write_entry(&mut self.frames, table, index, entry);
			self.mmu.invlpg(va);
		}
		Ok(())
	}

	/// Returns the backing frame of the page mapped at `va` in the directory
	/// `pgd`, along with the contiguous size in bytes remaining in its buddy
	/// block.
	pub fn virtual_to_page(&self, pgd: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, usize)> {
		let pte = self.pte_of(pgd, va)?;
		if pte & FLAG_PRESENT == 0 {
			return None;
		}
		let pa = entry_addr(pte);
		let (head, order) = self.frames.block_of(pa);
		Some((pa, get_block_size(order) - (pa - head)))
	}

	/// Allocates a new page directory, initialized as a byte-wise copy of the
	/// kernel directory.
	pub(crate) fn make_directory(&mut self) -> AllocResult<PhysAddr> {
		let pgd = self.alloc_table()?;
		self.frames.copy_page(pgd, self.kernel_pgd);
		Ok(pgd)
	}

	/// Destroys the page directory at `pgd`.
	///
	/// If the directory is bound, the kernel directory is bound first. Every
	/// present, non-global table page is returned to the table slab, then the
	/// directory itself.
	pub(crate) fn destroy_directory(&mut self, pgd: PhysAddr) {
		if self.mmu.is_bound(pgd) {
			let kernel_pgd = self.kernel_pgd;
			self.mmu.bind(kernel_pgd);
		}
		for index in 0..ENTRIES_PER_TABLE {
			let pde = read_entry(&self.frames, pgd, index);
			if pde & FLAG_PRESENT != 0 && pde & FLAG_GLOBAL == 0 {
				debug_assert!(pde & FLAG_AVAILABLE != 0);
				self.free_table(entry_addr(pde));
			}
		}
		self.free_table(pgd);
	}

	/// Translates `addr` through the bound directory for an access of the
	/// given kind, faulting exactly as the hardware would.
	pub fn translate(
		&mut self,
		addr: VirtAddr,
		write: bool,
		user: bool,
	) -> Result<PhysAddr, PageFault> {
		self.mmu.translate(&mut self.frames, addr, write, user)
	}

	/// Reads `buf.len()` bytes at the virtual address `addr` through the
	/// bound directory.
	pub fn read_virt(
		&mut self,
		addr: VirtAddr,
		buf: &mut [u8],
		user: bool,
	) -> Result<(), PageFault> {
		let mut off = 0;
		while off < buf.len() {
			let va = addr + off;
			let pa = self.mmu.translate(&mut self.frames, va, false, user)?;
			let n = (PAGE_SIZE - (va.0 & (PAGE_SIZE - 1))).min(buf.len() - off);
			buf[off..off + n].copy_from_slice(self.frames.slice(pa, n));
			off += n;
		}
		Ok(())
	}

	/// Writes `buf` at the virtual address `addr` through the bound
	/// directory.
	pub fn write_virt(&mut self, addr: VirtAddr, buf: &[u8], user: bool) -> Result<(), PageFault> {
		let mut off = 0;
		while off < buf.len() {
			let va = addr + off;
			let pa = self.mmu.translate(&mut self.frames, va, true, user)?;
			let n = (PAGE_SIZE - (va.0 & (PAGE_SIZE - 1))).min(buf.len() - off);
			self.frames.slice_mut(pa, n).copy_from_slice(&buf[off..off + n]);
			off += n;
		}
		Ok(())
	}

	/// Returns the cached TLB translation of the page at `addr`, if any.
	pub(crate) fn tlb_lookup(&self, addr: VirtAddr) -> Option<Entry> {
		self.mmu.tlb_lookup(addr)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::{KERNEL_BEGIN, LOWMEM_BEGIN};
	use x86::{PAGE_FAULT_PRESENT, PAGE_FAULT_USER, PAGE_FAULT_WRITE};

	fn new_core() -> MemoryCore {
		MemoryCore::new(512, 512)
	}

	#[test]
	fn kernel_window() {
		let mut core = new_core();
		// The low window is mapped globally in the kernel directory
		let pa = core.alloc_pages(0, GfpFlags::KERNEL).unwrap();
		let va = pa.kernel_to_virtual().unwrap();
		core.write_virt(va, &[0x42; 16], false).unwrap();
		assert_eq!(core.translate(va, true, false), Ok(pa));
		// Userspace has no business there
		let fault = core.translate(va, false, true).unwrap_err();
		assert_eq!(fault.code, PAGE_FAULT_PRESENT | PAGE_FAULT_USER);
		assert_eq!(core.fault_address(), va);
		core.free_pages(pa);
	}

	#[test]
	fn map_translate() {
		let mut core = new_core();
		let pgd = core.make_directory().unwrap();
		let block = core.alloc_pages(1, GfpFlags::USER).unwrap();
		let virt = VirtAddr(0x08000000);
		core.upd_vm_area(
			pgd,
			virt,
			block,
			2 * PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPD_ADDR,
		)
		.unwrap();
		core.mmu.bind(pgd);
		assert_eq!(core.translate(virt, false, true), Ok(block));
		assert_eq!(
			core.translate(virt + PAGE_SIZE + 0x123, true, true),
			Ok(block + PAGE_SIZE + 0x123)
		);
		// Unmapped addresses fault with a non-present code
		let fault = core.translate(VirtAddr(0x10000000), false, true).unwrap_err();
		assert_eq!(fault.code, PAGE_FAULT_USER);
		let fault = core.translate(VirtAddr(0x10000000), true, false).unwrap_err();
		assert_eq!(fault.code, PAGE_FAULT_WRITE);
		let kernel_pgd = core.kernel_directory();
		core.mmu.bind(kernel_pgd);
		core.free_pages(block);
		core.destroy_directory(pgd);
	}

	#[test]
	fn permission_widening() {
		let mut core = new_core();
		let pgd = core.make_directory().unwrap();
		let block = core.alloc_pages(0, GfpFlags::USER).unwrap();
		let virt = VirtAddr(0x08000000);
		// First mapping is kernel read-only; the next one widens the
		// directory entry to user-accessible
		core.upd_vm_area(pgd, virt, block, PAGE_SIZE, MapFlags::PRESENT | MapFlags::UPD_ADDR)
			.unwrap();
		let pde = core.dir_entry(pgd, virt);
		assert_eq!(pde & FLAG_USER, 0);
		let block2 = core.alloc_pages(0, GfpFlags::USER).unwrap();
		core.upd_vm_area(
			pgd,
			virt + PAGE_SIZE,
			block2,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPD_ADDR,
		)
		.unwrap();
		let pde = core.dir_entry(pgd, virt);
		assert_ne!(pde & FLAG_USER, 0);
		core.free_pages(block);
		core.free_pages(block2);
		core.destroy_directory(pgd);
	}

	#[test]
	fn tlb_invalidation() {
		let mut core = new_core();
		let pgd = core.make_directory().unwrap();
		let a = core.alloc_pages(0, GfpFlags::USER).unwrap();
		let b = core.alloc_pages(0, GfpFlags::USER).unwrap();
		let virt = VirtAddr(0x08000000);
		let flags = MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPD_ADDR;
		core.upd_vm_area(pgd, virt, a, PAGE_SIZE, flags).unwrap();
		core.mmu.bind(pgd);
		// Fill the TLB, then remap: the update must leave no stale entry
		assert_eq!(core.translate(virt, false, true), Ok(a));
		assert!(core.tlb_lookup(virt).is_some());
		core.upd_vm_area(pgd, virt, b, PAGE_SIZE, flags).unwrap();
		assert!(core.tlb_lookup(virt).is_none());
		assert_eq!(core.translate(virt, false, true), Ok(b));
		let kernel_pgd = core.kernel_directory();
		core.mmu.bind(kernel_pgd);
		core.free_pages(a);
		core.free_pages(b);
		core.destroy_directory(pgd);
	}

	#[test]
	fn lazy_clone_links() {
		let mut core = new_core();
		let src = core.make_directory().unwrap();
		let dst = core.make_directory().unwrap();
		let virt = VirtAddr(0x08000000);
		// A lazy copy-on-write slot in the source
		core.upd_vm_area(
			src,
			virt,
			PhysAddr(0),
			PAGE_SIZE,
			MapFlags::COW | MapFlags::RW | MapFlags::USER | MapFlags::UPD_ADDR,
		)
		.unwrap();
		core.clone_vm_area(src, dst, virt, PAGE_SIZE, MapFlags::COW | MapFlags::USER)
			.unwrap();
		let pte = core.pte_of(dst, virt).unwrap();
		assert_eq!(pte & FLAG_PRESENT, 0);
		assert_ne!(pte & FLAG_COW, 0);
		assert_eq!(core.cow_links.get(&(dst, virt)), Some(&(src, virt)));
		core.cow_links.remove(&(dst, virt));
		core.destroy_directory(dst);
		core.destroy_directory(src);
	}

	#[test]
	fn virt_to_page_block() {
		let mut core = new_core();
		let pgd = core.make_directory().unwrap();
		let block = core.alloc_pages(2, GfpFlags::USER).unwrap();
		let virt = VirtAddr(0x08000000);
		core.upd_vm_area(
			pgd,
			virt,
			block,
			4 * PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::UPD_ADDR,
		)
		.unwrap();
		let (pa, remaining) = core.virtual_to_page(pgd, virt + PAGE_SIZE).unwrap();
		assert_eq!(pa, block + PAGE_SIZE);
		assert_eq!(remaining, 3 * PAGE_SIZE);
		assert!(core.virtual_to_page(pgd, VirtAddr(0x10000000)).is_none());
		core.free_pages(block);
		core.destroy_directory(pgd);
	}

	#[test]
	fn directory_roundtrip() {
		let mut core = new_core();
		// Warm up the table slab once
		let pgd = core.make_directory().unwrap();
		let block = core.alloc_pages(0, GfpFlags::USER).unwrap();
		core.upd_vm_area(
			pgd,
			VirtAddr(0x08000000),
			block,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::USER | MapFlags::UPD_ADDR,
		)
		.unwrap();
		core.free_pages(block);
		core.destroy_directory(pgd);
		// A second identical cycle reuses the slab objects and releases
		// every page it acquired
		let baseline = core.frames.allocated_pages_count();
		let pgd = core.make_directory().unwrap();
		let block = core.alloc_pages(0, GfpFlags::USER).unwrap();
		core.upd_vm_area(
			pgd,
			VirtAddr(0x08000000),
			block,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::USER | MapFlags::UPD_ADDR,
		)
		.unwrap();
		core.free_pages(block);
		core.destroy_directory(pgd);
		assert_eq!(core.frames.allocated_pages_count(), baseline);
	}

	#[test]
	fn lowmem_constants() {
		assert_eq!(LOWMEM_BEGIN.kernel_to_virtual().unwrap(), KERNEL_BEGIN + LOWMEM_BEGIN.0);
		assert_eq!((KERNEL_BEGIN + 0x1000).kernel_to_physical().unwrap(), PhysAddr(0x1000));
	}
}
