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

//! A memory space is a virtual memory handler for a process. It handles
//! virtual and physical memory allocations for the process, as well as
//! linkage between them.
//!
//! The space owns a page directory, created as a byte-wise copy of the kernel
//! directory, and a sorted list of virtual memory areas. The page tables hold
//! the authoritative per-page state: a present entry maps a frame, and the
//! copy-on-write mark makes a present entry shared read-only or a non-present
//! entry a lazily populated slot.
//!
//! The page-fault handler resolves demand-paging and copy-on-write faults by
//! walking the tables directly. Illegal user accesses are reported for
//! `SIGSEGV` delivery; kernel faults and corrupted table state panic.

pub mod vma;

use crate::{
	errno::{AllocResult, EResult, EINVAL, ENOENT},
	memory::{
		buddy::{get_order, GfpFlags},
		vmem::{
			x86::{
				entry_addr, to_entry, PAGE_FAULT_USER, PAGE_FAULT_WRITE, FLAG_COW, FLAG_GLOBAL,
				FLAG_PRESENT, FLAG_USER, FLAG_WRITE,
			},
			MapFlags,
		},
		MemoryCore, PhysAddr, VirtAddr, KMAP_BEGIN, KMAP_END, PAGE_SIZE, PROCAREA_BEGIN,
		PROCAREA_END,
	},
};
use alloc::vec::Vec;
use log::{debug, trace};
use vma::VmArea;

/// The outcome of a page-fault resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
	/// The fault was resolved; the access can be retried.
	Resolved,
	/// The access is illegal; `SIGSEGV` must be delivered to the current
	/// task.
	Segv,
}

/// A virtual memory space.
pub struct MemSpace {
	/// The space's page directory.
	pgd: PhysAddr,
	/// The virtual memory areas of the space, sorted ascending by start
	/// address. Areas are pairwise disjoint.
	mmap_list: Vec<VmArea>,
	/// Index of the most recently used area, checked before searching.
	mmap_cache: Option<usize>,
	/// The base of the user stack area.
	start_stack: VirtAddr,
	/// The number of areas in the space.
	map_count: usize,
	/// The number of mapped virtual pages.
	total_vm: usize,
}

impl MemSpace {
	/// Creates an empty memory space whose directory is a byte-wise copy of
	/// the kernel directory.
	pub fn new(core: &mut MemoryCore) -> AllocResult<Self> {
		Ok(Self {
			pgd: core.make_directory()?,
			mmap_list: Vec::new(),
			mmap_cache: None,
			start_stack: VirtAddr(0),
			map_count: 0,
			total_vm: 0,
		})
	}

	/// Returns the physical address of the space's page directory.
	#[inline]
	pub fn pgd(&self) -> PhysAddr {
		self.pgd
	}

	/// Returns the areas of the space, sorted ascending.
	#[inline]
	pub fn vm_areas(&self) -> &[VmArea] {
		&self.mmap_list
	}

	/// Returns the number of areas in the space.
	#[inline]
	pub fn map_count(&self) -> usize {
		self.map_count
	}

	/// Returns the number of mapped virtual pages.
	#[inline]
	pub fn total_vm(&self) -> usize {
		self.total_vm
	}

	/// Returns the base of the user stack area.
	#[inline]
	pub fn start_stack(&self) -> VirtAddr {
		self.start_stack
	}

	/// Binds the space's directory on the MMU.
	pub fn bind(&self, core: &mut MemoryCore) {
		core.mmu.bind(self.pgd);
	}

	/// Creates an area of `size` bytes at `start`.
	///
	/// If `pgflags` contains [`MapFlags::COW`], the mapping is installed
	/// non-present and populated lazily by the page-fault handler. Otherwise
	/// frames are allocated eagerly in one buddy block, zeroed, and mapped
	/// present.
	///
	/// An overlap with an existing area is a kernel invariant violation and
	/// panics.
	pub fn create_vm_area(
		&mut self,
		core: &mut MemoryCore,
		start: VirtAddr,
		size: usize,
		pgflags: MapFlags,
		gfpflags: GfpFlags,
	) -> AllocResult<()> {
		let pages = size.div_ceil(PAGE_SIZE);
		let end = start + pages * PAGE_SIZE;
		match self.is_valid_vm_area(start, end) {
			Ok(true) => {}
			Ok(false) => panic!("virtual memory area overlap: [{start:?}, {end:?})"),
			Err(_) => panic!("malformed virtual memory area: [{start:?}, {end:?})"),
		}
		if pgflags.contains(MapFlags::COW) {
			// Lazy: non-present slots carrying the wanted permissions
			let flags =
				(pgflags & (MapFlags::RW | MapFlags::USER)) | MapFlags::COW | MapFlags::UPD_ADDR;
			core.upd_vm_area(self.pgd, start, PhysAddr(0), size, flags)?;
		} else {
			let order = get_order(pages);
			let block = core.frames.alloc(order, gfpflags)?;
			core.zero_frame(block, order);
			core.frames.drop_tail(block, pages);
			let flags = (pgflags & (MapFlags::RW | MapFlags::USER | MapFlags::GLOBAL))
				| MapFlags::PRESENT
				| MapFlags::UPD_ADDR;
			core.upd_vm_area(self.pgd, start, block, size, flags)?;
		}
		let pos = self
			.mmap_list
			.binary_search_by(|v| v.vm_start.cmp(&start))
			.unwrap_err();
		self.mmap_list.insert(pos, VmArea::new(start, end, pgflags));
		self.mmap_cache = Some(pos);
		self.map_count += 1;
		self.total_vm += pages;
		trace!("mem_space: create [{start:?}, {end:?})");
		Ok(())
	}

	/// Clones the area starting at `start` of `src` into this space.
	///
	/// With `cow` unset, fresh frames are allocated, mapped present and
	/// writable, and the source contents are copied through transient kernel
	/// mappings. With `cow` set, present source slots are downgraded to
	/// copy-on-write read-only and their frames shared, while lazy source
	/// slots make the destination a lazy indirection.
	pub fn clone_vm_area(
		&mut self,
		core: &mut MemoryCore,
		src: &mut MemSpace,
		start: VirtAddr,
		cow: bool,
		gfpflags: GfpFlags,
	) -> AllocResult<()> {
		let (vm_start, vm_end, pgflags) = {
			let vma = src
				.find_vm_area(start)
				.expect("cloning a non-existent virtual memory area");
			(vma.vm_start, vma.vm_end, vma.flags)
		};
		let pages = (vm_end - vm_start) / PAGE_SIZE;
		if !cow {
			// Deep copy on fresh frames, mapped writable
			let order = get_order(pages);
			let block = core.frames.alloc(order, gfpflags)?;
			core.frames.drop_tail(block, pages);
			for i in 0..pages {
				let va = vm_start + i * PAGE_SIZE;
				let dst = block + i * PAGE_SIZE;
				match core.virtual_to_page(src.pgd, va) {
					Some((src_pa, _)) => core.copy_frame(dst, src_pa),
					// An unfaulted lazy page reads as zeros
					None => core.zero_frame(dst, 0),
				}
			}
			let flags = (pgflags & MapFlags::USER)
				| MapFlags::PRESENT
				| MapFlags::RW
				| MapFlags::UPD_ADDR;
			core.upd_vm_area(self.pgd, vm_start, block, pages * PAGE_SIZE, flags)?;
		} else {
			let shared = (pgflags & MapFlags::USER) | MapFlags::PRESENT | MapFlags::COW;
			for i in 0..pages {
				let va = vm_start + i * PAGE_SIZE;
				let entry = core.pte_of(src.pgd, va).unwrap_or(0);
				if entry & FLAG_PRESENT != 0 {
					// Downgrade the source slot, then share the frame
					core.upd_vm_area(src.pgd, va, PhysAddr(0), PAGE_SIZE, shared)?;
					core.clone_vm_area(src.pgd, self.pgd, va, PAGE_SIZE, shared)?;
					core.frames.frame_inc(entry_addr(entry));
				} else {
					// Lazy slot: the walker installs the shadow indirection
					core.clone_vm_area(src.pgd, self.pgd, va, PAGE_SIZE, shared)?;
				}
			}
		}
		let pos = self
			.mmap_list
			.binary_search_by(|v| v.vm_start.cmp(&vm_start))
			.unwrap_err();
		self.mmap_list
			.insert(pos, VmArea::new(vm_start, vm_end, pgflags));
		self.mmap_cache = Some(pos);
		self.map_count += 1;
		self.total_vm += pages;
		Ok(())
	}

	/// Destroys the area starting at `start`.
	///
	/// Every backing frame loses one reference; a buddy block whose frames
	/// are no longer referenced anywhere goes back to the zone allocator.
	/// Lazy slots and their shadow links are discarded.
	pub fn destroy_vm_area(&mut self, core: &mut MemoryCore, start: VirtAddr) -> EResult<()> {
		let idx = self
			.mmap_list
			.iter()
			.position(|v| v.vm_start == start)
			.ok_or(ENOENT)?;
		let vma = self.mmap_list.remove(idx);
		// Other spaces may still hold lazy indirections into this area;
		// populate them before the slots go away
		let dependants: Vec<(PhysAddr, VirtAddr)> = core
			.cow_links
			.iter()
			.filter(|(_, src)| src.0 == self.pgd && vma.contains(src.1))
			.map(|(dst, _)| *dst)
			.collect();
		for (dst_pgd, dst_va) in dependants {
			resolve_cow_slot(core, dst_pgd, dst_va);
		}
		let mut va = vma.vm_start;
		while va < vma.vm_end {
			if let Some((pa, _)) = core.virtual_to_page(self.pgd, va) {
				core.frames.release_page(pa);
			}
			core.cow_links.remove(&(self.pgd, va));
			core.clear_entry(self.pgd, va);
			va = va + PAGE_SIZE;
		}
		self.mmap_cache = None;
		self.map_count -= 1;
		self.total_vm -= vma.pages();
		trace!("mem_space: destroy [{:?}, {:?})", vma.vm_start, vma.vm_end);
		Ok(())
	}

	/// Returns the area starting exactly at `start`, if any.
	pub fn find_vm_area(&mut self, start: VirtAddr) -> Option<&VmArea> {
		if let Some(i) = self.mmap_cache {
			if self
				.mmap_list
				.get(i)
				.is_some_and(|v| v.vm_start == start)
			{
				return Some(&self.mmap_list[i]);
			}
		}
		let i = self
			.mmap_list
			.binary_search_by(|v| v.vm_start.cmp(&start))
			.ok()?;
		self.mmap_cache = Some(i);
		Some(&self.mmap_list[i])
	}

	/// Tells whether the half-open range `[start, end)` may become a new
	/// area.
	///
	/// Returns `Ok(true)` if the range is disjoint from every existing area,
	/// `Ok(false)` if it overlaps one, and `EINVAL` if the range is
	/// malformed.
	pub fn is_valid_vm_area(&self, start: VirtAddr, end: VirtAddr) -> EResult<bool> {
		if start >= end
			|| !start.is_aligned_to(PAGE_SIZE)
			|| start < PROCAREA_BEGIN
			|| end > PROCAREA_END
		{
			return Err(EINVAL);
		}
		Ok(self.mmap_list.iter().all(|v| !v.intersects(start, end)))
	}

	/// Returns the start of the first gap of at least `size` bytes between
	/// the existing areas, searching ascending.
	pub fn find_free_vm_area(&self, size: usize) -> Option<VirtAddr> {
		let len = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
		let mut prev_end = PROCAREA_BEGIN;
		for vma in &self.mmap_list {
			if vma.vm_start - prev_end >= len {
				return Some(prev_end);
			}
			prev_end = vma.vm_end;
		}
		(PROCAREA_END - prev_end >= len).then_some(prev_end)
	}

	/// Resolves a page fault at `addr` with the hardware error `code`.
	///
	/// Demand-paging and copy-on-write faults are resolved against the page
	/// tables; faults in the transient mapping window resolve the recorded
	/// source slot first. Unresolvable user-mode faults return
	/// [`FaultOutcome::Segv`] so the caller delivers the signal and re-enters
	/// the scheduler; unresolvable kernel-mode faults panic.
	pub fn handle_page_fault(
		&mut self,
		core: &mut MemoryCore,
		addr: VirtAddr,
		code: u32,
	) -> FaultOutcome {
		let user = code & PAGE_FAULT_USER != 0;
		let write = code & PAGE_FAULT_WRITE != 0;
		let page = addr.down_align_to(PAGE_SIZE);
		let pde = core.dir_entry(self.pgd, page);
		if pde & FLAG_PRESENT == 0 {
			if user {
				debug!("segfault at {addr:?} (code {code:#x})");
				return FaultOutcome::Segv;
			}
			panic!("kernel page fault at {addr:?} with no page table (code {code:#x})");
		}
		// Faults in the transient mapping window resolve through the shadow
		// table: the recorded source slot is populated, then shared here
		if (KMAP_BEGIN..KMAP_END).contains(&page) {
			let Some((src_pgd, src_va)) = core.cow_links.remove(&(self.pgd, page)) else {
				panic!("unresolvable fault in the transient mapping window at {addr:?}");
			};
			let pa = resolve_cow_slot(core, src_pgd, src_va);
			core.frames.frame_inc(pa);
			let entry = to_entry(pa, FLAG_PRESENT | FLAG_WRITE | FLAG_GLOBAL | FLAG_COW);
			core.set_pte(self.pgd, page, entry);
			return FaultOutcome::Resolved;
		}
		let mut entry = core
			.pte_of(self.pgd, page)
			.expect("page table vanished under fault");
		// Lazy slot, first touch since creation or clone
		if entry & FLAG_COW != 0 && entry & FLAG_PRESENT == 0 {
			if core.cow_links.contains_key(&(self.pgd, page)) {
				// Cloned slot: populate the source chain, then share
				// read-only; a write keeps going and breaks the shared
				// frame below
				resolve_cow_slot(core, self.pgd, page);
				entry = core.pte_of(self.pgd, page).unwrap();
				if !write {
					return FaultOutcome::Resolved;
				}
			} else {
				// Demand-zero: a fresh frame, zeroed through the window
				let frame = core
					.frames
					.alloc(0, GfpFlags::USER | GfpFlags::ATOMIC)
					.expect("out of memory resolving a page fault");
				core.zero_frame(frame, 0);
				let entry = to_entry(frame, (entry & (FLAG_USER | FLAG_WRITE)) | FLAG_PRESENT);
				core.set_pte(self.pgd, page, entry);
				trace!("mem_space: demand-zero at {page:?}");
				return FaultOutcome::Resolved;
			}
		}
		// Copy-on-write break on a present shared slot
		if entry & FLAG_COW != 0 && entry & FLAG_PRESENT != 0 && write {
			let pa = entry_addr(entry);
			if core.frames.frame_count(pa) > 1 {
				// The frame is shared: copy to a private one
				let frame = core
					.frames
					.alloc(0, GfpFlags::USER | GfpFlags::ATOMIC)
					.expect("out of memory resolving a page fault");
				core.copy_frame(frame, pa);
				core.frames.release_page(pa);
				let entry = to_entry(frame, (entry & FLAG_USER) | FLAG_PRESENT | FLAG_WRITE);
				core.set_pte(self.pgd, page, entry);
				trace!("mem_space: copy-on-write break at {page:?}");
			} else {
				// Last sharer: reclaim write access in place
				let entry = (entry | FLAG_PRESENT | FLAG_WRITE) & !FLAG_COW;
				core.set_pte(self.pgd, page, entry);
			}
			return FaultOutcome::Resolved;
		}
		if user {
			debug!("segfault at {addr:?} (code {code:#x})");
			return FaultOutcome::Segv;
		}
		panic!("unhandled kernel page fault at {addr:?} (code {code:#x})");
	}
}

/// Populates the slot `(pgd, va)` if it is still lazy, returning its backing
/// frame.
///
/// A slot holding a shadow link resolves its source first, following chains
/// left by repeated cloning, then shares the source frame copy-on-write
/// read-only on both sides. A plain lazy slot gets a fresh zeroed frame.
fn resolve_cow_slot(core: &mut MemoryCore, pgd: PhysAddr, va: VirtAddr) -> PhysAddr {
	let entry = core.pte_of(pgd, va).expect("dangling lazy clone link");
	if entry & FLAG_PRESENT != 0 {
		return entry_addr(entry);
	}
	debug_assert!(
		entry & FLAG_COW != 0,
		"lazy clone link to a non copy-on-write slot"
	);
	if let Some((src_pgd, src_va)) = core.cow_links.remove(&(pgd, va)) {
		let pa = resolve_cow_slot(core, src_pgd, src_va);
		// The frame becomes shared: both slots drop to read-only
		let src_entry = core.pte_of(src_pgd, src_va).unwrap();
		core.set_pte(src_pgd, src_va, (src_entry | FLAG_COW) & !FLAG_WRITE);
		core.frames.frame_inc(pa);
		core.set_pte(
			pgd,
			va,
			to_entry(pa, (entry & FLAG_USER) | FLAG_PRESENT | FLAG_COW),
		);
		return pa;
	}
	let frame = core
		.frames
		.alloc(0, GfpFlags::USER | GfpFlags::ATOMIC)
		.expect("out of memory resolving a page fault");
	core.zero_frame(frame, 0);
	core.set_pte(
		pgd,
		va,
		to_entry(frame, (entry & (FLAG_USER | FLAG_WRITE)) | FLAG_PRESENT),
	);
	frame
}

/// Creates a blank process image: an address space with a single lazy user
/// stack area of `stack_size` bytes ending at the top of the user area.
pub fn create_blank_process_image(
	core: &mut MemoryCore,
	stack_size: usize,
) -> AllocResult<MemSpace> {
	let mut mm = MemSpace::new(core)?;
	let pages = stack_size.div_ceil(PAGE_SIZE);
	let start = PROCAREA_END - pages * PAGE_SIZE;
	mm.create_vm_area(
		core,
		start,
		pages * PAGE_SIZE,
		MapFlags::PRESENT | MapFlags::RW | MapFlags::USER | MapFlags::COW,
		GfpFlags::USER,
	)?;
	mm.start_stack = start;
	debug!("mem_space: blank image, stack at {start:?}");
	Ok(mm)
}

/// Clones a process image for forking.
///
/// The clone starts from a fresh copy of the kernel directory, never from
/// the source directory: sharing the source directory would alias page-table
/// pages between the two spaces. Every area is then cloned copy-on-write.
pub fn clone_process_image(core: &mut MemoryCore, src: &mut MemSpace) -> AllocResult<MemSpace> {
	let mut mm = MemSpace::new(core)?;
	let starts: Vec<VirtAddr> = src.mmap_list.iter().map(|v| v.vm_start).collect();
	for start in starts {
		mm.clone_vm_area(core, src, start, true, GfpFlags::USER)?;
	}
	mm.start_stack = src.start_stack;
	debug!("mem_space: cloned image at {:?}", mm.pgd);
	Ok(mm)
}

/// Destroys a process image.
///
/// If the space's directory is bound, the kernel directory is bound first.
/// Every area is destroyed, then every non-global table page and the
/// directory go back to the table slab.
pub fn destroy_process_image(core: &mut MemoryCore, mut mm: MemSpace) {
	if core.mmu.is_bound(mm.pgd) {
		let kernel_pgd = core.kernel_directory();
		core.mmu.bind(kernel_pgd);
	}
	let starts: Vec<VirtAddr> = mm.mmap_list.iter().map(|v| v.vm_start).collect();
	for start in starts {
		let _ = mm.destroy_vm_area(core, start);
	}
	core.destroy_directory(mm.pgd);
	debug!("mem_space: destroyed image at {:?}", mm.pgd);
}
