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

//! Physical and virtual memory management.
//!
//! The system's virtual memory is divided in two chunks:
//! - Userspace: virtual memory below [`PROCAREA_END`], used by the currently
//!   running process
//! - Kernelspace: virtual memory from [`KERNEL_BEGIN`] up, used by the kernel
//!   itself and shared across processes
//!
//! Physical memory starts at the 1 MiB boundary and is directly mapped in the
//! kernelspace low window, so a physical address and its kernel virtual
//! counterpart differ by a constant. A small window of transient mappings
//! ([`kmap`]) sits at the top of the kernelspace, above the low window.

use crate::errno::AllocResult;
use alloc::collections::BTreeMap;
use core::fmt;
use log::info;

pub mod buddy;
pub mod cache;
pub mod kmap;
pub mod stats;
pub mod vmem;

use buddy::{FrameAllocator, GfpFlags};
use cache::{CacheId, CacheRegistry, Ctor};
use vmem::x86::Mmu;

/// The size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Address of the beginning of the virtual memory usable by processes.
///
/// The first page is kept unmapped so that the null pointer never resolves.
pub const PROCAREA_BEGIN: VirtAddr = VirtAddr(PAGE_SIZE);
/// Address of the end of the virtual memory reserved to the process.
pub const PROCAREA_END: VirtAddr = VirtAddr(0xc0000000);

/// Address of the beginning of the kernelspace, where physical memory is
/// directly mapped.
pub const KERNEL_BEGIN: VirtAddr = VirtAddr(0xc0000000);

/// Address of the beginning of the transient kernel mapping window.
pub const KMAP_BEGIN: VirtAddr = VirtAddr(0xf8000000);
/// Address of the end of the transient kernel mapping window.
pub const KMAP_END: VirtAddr = VirtAddr(0xf8400000);

/// Physical address of the first allocatable frame. Memory below the 1 MiB
/// boundary is reserved.
pub const LOWMEM_BEGIN: PhysAddr = PhysAddr(0x100000);

/// Type representing a memory page.
pub type Page = [u8; PAGE_SIZE];

/// An address on physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
	/// Converts the physical address to a kernel virtual address in the low
	/// window.
	///
	/// If the address is outside the directly-mapped window, the function
	/// returns `None`.
	pub fn kernel_to_virtual(self) -> Option<VirtAddr> {
		if self.0 < KMAP_BEGIN.0 - KERNEL_BEGIN.0 {
			Some(VirtAddr(self.0 + KERNEL_BEGIN.0))
		} else {
			None
		}
	}
}

/// An address on virtual memory.
///
/// This would usually be represented by a pointer. The model keeps it as a
/// plain number since virtual addresses are resolved through the page tables,
/// never dereferenced directly.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
	/// Converts the kernel virtual address to a physical address.
	///
	/// If the address is outside the directly-mapped low window, the function
	/// returns `None`.
	pub fn kernel_to_physical(self) -> Option<PhysAddr> {
		if (KERNEL_BEGIN.0..KMAP_BEGIN.0).contains(&self.0) {
			Some(PhysAddr(self.0 - KERNEL_BEGIN.0))
		} else {
			None
		}
	}
}

macro_rules! addr_impl {
	($name:ident) => {
		impl $name {
			/// Tells whether the address is null.
			pub fn is_null(self) -> bool {
				self.0 == 0
			}

			/// Tells whether the address is aligned to `align`.
			pub fn is_aligned_to(self, align: usize) -> bool {
				self.0 % align == 0
			}

			/// Computes and returns the next address to be aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn align_to(self, align: usize) -> Self {
				Self(self.0.next_multiple_of(align))
			}

			/// Computes and returns the previous address to be aligned to
			/// `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn down_align_to(self, align: usize) -> Self {
				Self(self.0 & !(align - 1))
			}
		}

		impl core::ops::Add<usize> for $name {
			type Output = Self;

			/// Adds the given offset in bytes, wrapping on overflow.
			fn add(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_add(off))
			}
		}

		impl core::ops::Sub<usize> for $name {
			type Output = Self;

			/// Subtracts the given offset in bytes, wrapping on overflow.
			fn sub(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_sub(off))
			}
		}

		impl core::ops::Sub for $name {
			type Output = usize;

			/// Returns the distance in bytes between the two addresses.
			fn sub(self, other: Self) -> Self::Output {
				self.0 - other.0
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(fmt, "{:08x}", self.0)
			}
		}
	};
}

addr_impl!(PhysAddr);
addr_impl!(VirtAddr);

/// The memory core context.
///
/// It owns every process-wide structure of the subsystem: the zone allocator
/// with the page frame database, the slab cache registry, the kernel page
/// directory and the modelled MMU. It is created once at boot and passed
/// explicitly through the kernel.
pub struct MemoryCore {
	/// The zone allocator and page frame database.
	pub(crate) frames: FrameAllocator,
	/// The slab cache registry.
	pub(crate) caches: CacheRegistry,
	/// The MMU: control registers and TLB.
	pub(crate) mmu: Mmu,
	/// Slot usage of the transient mapping window.
	pub(crate) kmap: kmap::KmapWindow,
	/// Shadow table for lazily cloned page-table slots: maps a destination
	/// `(directory, page)` to the source `(directory, page)` it is to be
	/// resolved from.
	pub(crate) cow_links: BTreeMap<(PhysAddr, VirtAddr), (PhysAddr, VirtAddr)>,
	/// The kernel page directory, never modified after init except for the
	/// shared transient-mapping tables.
	kernel_pgd: PhysAddr,
	/// The slab cache backing page directories and page tables.
	pub(crate) table_cache: CacheId,
}

impl MemoryCore {
	/// Initializes the memory core with `kernel_pages` pages of kernel zone
	/// memory and `user_pages` pages of user zone memory.
	///
	/// The function sets up the zone allocator, the slab caches, the kernel
	/// page directory with its global low-window mappings and the transient
	/// mapping window, then binds the kernel directory.
	pub fn new(kernel_pages: usize, user_pages: usize) -> Self {
		let frames = FrameAllocator::new(kernel_pages, user_pages);
		let mut caches = CacheRegistry::new();
		let table_cache = caches.create(
			"pgtbl",
			PAGE_SIZE,
			PAGE_SIZE,
			GfpFlags::KERNEL,
			None,
			None,
		);
		let mut core = Self {
			frames,
			caches,
			mmu: Mmu::new(),
			kmap: kmap::KmapWindow::new(),
			cow_links: BTreeMap::new(),
			kernel_pgd: PhysAddr(0),
			table_cache,
		};
		let pgd = core
			.alloc_table()
			.expect("not enough memory for the kernel page directory");
		core.kernel_pgd = pgd;
		// Direct-map every zone in the low window, globally
		for (begin, pages) in core.frames.zone_ranges() {
			let virt = begin.kernel_to_virtual().unwrap();
			core.upd_vm_area(
				pgd,
				virt,
				begin,
				pages * PAGE_SIZE,
				vmem::MapFlags::PRESENT
					| vmem::MapFlags::RW
					| vmem::MapFlags::GLOBAL
					| vmem::MapFlags::UPD_ADDR,
			)
			.expect("not enough memory for the kernel low window");
		}
		core.kmap_init()
			.expect("not enough memory for the kernel mapping window");
		core.mmu.bind(pgd);
		info!(
			"memory: {} kernel pages, {} user pages",
			kernel_pages, user_pages
		);
		core
	}

	/// Returns the physical address of the kernel page directory.
	#[inline]
	pub fn kernel_directory(&self) -> PhysAddr {
		self.kernel_pgd
	}

	/// Returns the physical address of the currently bound page directory.
	#[inline]
	pub fn current_directory(&self) -> PhysAddr {
		self.mmu.current()
	}

	/// Returns the virtual address whose translation faulted last.
	#[inline]
	pub fn fault_address(&self) -> VirtAddr {
		self.mmu.fault_address()
	}

	/// Allocates a block of `2^order` contiguous physical pages.
	///
	/// On success, the function returns the physical address of the first
	/// frame of the block. On out-of-memory, it returns an error.
	pub fn alloc_pages(&mut self, order: buddy::FrameOrder, flags: GfpFlags) -> AllocResult<PhysAddr> {
		self.frames.alloc(order, flags)
	}

	/// Frees the block of pages starting at `addr`.
	///
	/// If the block's frames are shared, the function only drops one
	/// reference from each frame and leaves the memory allocated.
	pub fn free_pages(&mut self, addr: PhysAddr) {
		self.frames.free(addr);
	}

	/// Increments the reference count of the frame at `addr`.
	#[inline]
	pub fn page_inc(&self, addr: PhysAddr) {
		self.frames.frame_inc(addr);
	}

	/// Decrements the reference count of the frame at `addr`.
	#[inline]
	pub fn page_dec(&mut self, addr: PhysAddr) {
		self.frames.release_page(addr);
	}

	/// Returns the reference count of the frame at `addr`.
	#[inline]
	pub fn page_count(&self, addr: PhysAddr) -> u32 {
		self.frames.frame_count(addr)
	}

	/// Creates a named object cache.
	///
	/// Arguments:
	/// - `name` is the cache's name, for diagnostics
	/// - `size` is the size of one object in bytes
	/// - `align` is the required alignment of objects
	/// - `flags` are the allocation flags passed through to the zone allocator
	/// - `ctor` is run once on each object when its slab is created
	/// - `dtor` is run once on each object when its slab is reclaimed
	pub fn kmem_cache_create(
		&mut self,
		name: &'static str,
		size: usize,
		align: usize,
		flags: GfpFlags,
		ctor: Option<Ctor>,
		dtor: Option<Ctor>,
	) -> CacheId {
		self.caches.create(name, size, align, flags, ctor, dtor)
	}

	/// Destroys the cache `id`.
	///
	/// If any object of the cache is still allocated, the function fails with
	/// `EBUSY` and mutates nothing.
	pub fn kmem_cache_destroy(&mut self, id: CacheId) -> crate::errno::EResult<()> {
		self.caches.destroy(&mut self.frames, id)
	}

	/// Allocates one object from the cache `id`.
	pub fn kmem_cache_alloc(&mut self, id: CacheId, gfp: GfpFlags) -> AllocResult<VirtAddr> {
		self.caches.alloc(&mut self.frames, id, gfp)
	}

	/// Frees an object previously allocated from the cache `id`.
	pub fn kmem_cache_free(&mut self, addr: VirtAddr) {
		self.caches.free(&mut self.frames, addr);
	}

	/// Allocates `size` bytes from the size-bucketed general caches.
	#[track_caller]
	pub fn kmalloc(&mut self, size: usize) -> AllocResult<VirtAddr> {
		self.caches.kmalloc(&mut self.frames, size)
	}

	/// Frees memory allocated with [`Self::kmalloc`].
	#[track_caller]
	pub fn kfree(&mut self, addr: VirtAddr) {
		self.caches.kfree(&mut self.frames, addr);
	}
}
