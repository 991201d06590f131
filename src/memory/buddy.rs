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

//! The buddy allocator allows to allocate blocks of `2^n` pages of memory.
//!
//! This allocator works by dividing blocks of memory in two recursively until
//! a block of the required size is available.
//!
//! The order of a block is the `n` in the expression `pow(2, n)` that
//! represents the size of the block in pages.
//!
//! Each physical page frame has a descriptor in the page frame database:
//! free-list linkage, the order of its block and a reference count. A frame
//! is mapped writable only while its reference count is exactly `1`; shared
//! frames are read-only everywhere and duplicated on write by the page-fault
//! handler.

use crate::{
	errno::{AllocError, AllocResult},
	memory::{PhysAddr, LOWMEM_BEGIN, PAGE_SIZE},
};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering::Relaxed};
use log::debug;

/// The order of a memory block.
pub type FrameOrder = u8;
/// The identifier of a frame inside its zone.
type FrameId = u32;

/// The maximum order of a buddy allocated block.
pub const MAX_ORDER: FrameOrder = 10;

/// The number of memory zones.
pub const ZONES_COUNT: usize = 2;

/// Value indicating that the frame is used.
const FRAME_STATE_USED: FrameId = !0_u32;

bitflags::bitflags! {
	/// Allocation flags, passed through from every allocation front end down
	/// to the zone allocator.
	pub struct GfpFlags: u32 {
		/// Allocate kernel memory. The allocation may sleep.
		const KERNEL = 0b001;
		/// The allocation happens in interrupt context and must not sleep.
		const ATOMIC = 0b010;
		/// Allocate memory for userspace, from the user zone first.
		const USER = 0b100;
	}
}

/// The metadata for a frame of physical memory.
///
/// The free list is linked by frame identifiers rather than pointers: a frame
/// pointing to itself is the end of its list, and [`FRAME_STATE_USED`] in
/// either link marks the frame as allocated.
struct Frame {
	/// Identifier of the previous frame in the free list.
	prev: FrameId,
	/// Identifier of the next frame in the free list.
	next: FrameId,
	/// Order of the block the frame belongs to.
	order: FrameOrder,
	/// Offset of the frame from the head of its block, in pages.
	head_off: u16,
	/// Number of mappings referencing the frame. Atomic with respect to the
	/// page-fault handler.
	ref_count: AtomicU32,
}

impl Frame {
	fn new() -> Self {
		Self {
			prev: 0,
			next: 0,
			order: 0,
			head_off: 0,
			ref_count: AtomicU32::new(0),
		}
	}

	/// Tells whether the frame is used or not.
	#[inline]
	fn is_used(&self) -> bool {
		(self.prev == FRAME_STATE_USED) || (self.next == FRAME_STATE_USED)
	}

	/// Marks the frame as used. The frame must not be linked to any free list.
	#[inline]
	fn mark_used(&mut self) {
		self.prev = FRAME_STATE_USED;
		self.next = FRAME_STATE_USED;
	}

	/// Marks the frame as free. The frame must not be linked to any free list.
	#[inline]
	fn mark_free(&mut self, id: FrameId) {
		self.prev = id;
		self.next = id;
	}
}

/// An allocatable zone of memory.
///
/// The zone owns its backing memory: physical addresses inside the zone index
/// into `mem`.
pub(crate) struct Zone {
	/// Physical address of the beginning of the zone.
	begin: PhysAddr,
	/// The backing memory of the zone.
	mem: Vec<u8>,
	/// The frame database of the zone.
	frames: Vec<Frame>,
	/// The free lists, one per order.
	free_list: [Option<FrameId>; (MAX_ORDER + 1) as usize],
	/// The number of allocated pages in the zone.
	allocated_pages: usize,
}

impl Zone {
	/// Creates a zone of `pages` pages starting at physical address `begin`.
	fn new(name: &'static str, begin: PhysAddr, pages: usize) -> Self {
		debug_assert!(begin.is_aligned_to(PAGE_SIZE));
		let mut zone = Self {
			begin,
			mem: alloc::vec![0; pages * PAGE_SIZE],
			frames: (0..pages).map(|_| Frame::new()).collect(),
			free_list: [None; (MAX_ORDER + 1) as usize],
			allocated_pages: 0,
		};
		zone.fill_free_list();
		debug!("buddy: zone {} at {:?}, {} pages", name, begin, pages);
		zone
	}

	#[inline]
	fn pages_count(&self) -> FrameId {
		self.frames.len() as FrameId
	}

	/// Tells whether the zone contains the physical address `addr`.
	#[inline]
	fn contains(&self, addr: PhysAddr) -> bool {
		addr >= self.begin && addr.0 < self.begin.0 + self.mem.len()
	}

	/// Returns the identifier of the frame at the physical address `addr`.
	#[inline]
	fn frame_id(&self, addr: PhysAddr) -> FrameId {
		debug_assert!(self.contains(addr));
		((addr - self.begin) / PAGE_SIZE) as FrameId
	}

	/// Returns the physical address of the frame `id`.
	#[inline]
	fn frame_addr(&self, id: FrameId) -> PhysAddr {
		self.begin + (id as usize) * PAGE_SIZE
	}

	/// Fills the free list during initialization according to the number of
	/// available pages.
	fn fill_free_list(&mut self) {
		let mut frame: FrameId = 0;
		let mut order = MAX_ORDER;
		while frame < self.pages_count() {
			// Check the order fits in remaining pages
			let p = 1 << order;
			if frame + p > self.pages_count() {
				order -= 1;
				continue;
			}
			// Init frame
			let f = &mut self.frames[frame as usize];
			f.mark_free(frame);
			f.order = order;
			self.link(frame);
			// Jump to next offset
			frame += p;
		}
		#[cfg(debug_assertions)]
		self.check_free_list();
	}

	/// Returns an available frame owned by this zone, with an order of at
	/// least `order`.
	fn get_available_frame(&self, order: FrameOrder) -> Option<FrameId> {
		self.free_list[(order as usize)..].iter().find_map(|f| *f)
	}

	/// Links the frame `id` into the zone's free list.
	fn link(&mut self, id: FrameId) {
		debug_assert!(!self.frames[id as usize].is_used());
		let order = self.frames[id as usize].order;
		let next = match self.free_list[order as usize] {
			Some(first) => {
				debug_assert!(!self.frames[first as usize].is_used());
				self.frames[first as usize].prev = id;
				first
			}
			None => id,
		};
		self.frames[id as usize].prev = id;
		self.frames[id as usize].next = next;
		self.free_list[order as usize] = Some(id);
	}

	/// Unlinks the frame `id` from the zone's free list. The frame must not
	/// be used.
	fn unlink(&mut self, id: FrameId) {
		debug_assert!(!self.frames[id as usize].is_used());
		let prev = self.frames[id as usize].prev;
		let next = self.frames[id as usize].next;
		let order = self.frames[id as usize].order;
		let has_prev = prev != id;
		let has_next = next != id;
		if self.free_list[order as usize] == Some(id) {
			self.free_list[order as usize] = has_next.then_some(next);
		}
		if has_prev {
			self.frames[prev as usize].next = if has_next { next } else { prev };
		}
		if has_next {
			self.frames[next as usize].prev = if has_prev { prev } else { next };
		}
		self.frames[id as usize].mark_free(id);
	}

	/// Unlinks the frame `id`, splits it until it reaches the required order
	/// `order` while linking the new free blocks to the free list.
	///
	/// At the end of the function, the frame is **not** linked to the free
	/// list.
	fn split(&mut self, id: FrameId, order: FrameOrder) {
		debug_assert!(!self.frames[id as usize].is_used());
		debug_assert!(order <= MAX_ORDER);
		debug_assert!(self.frames[id as usize].order >= order);
		self.unlink(id);
		while self.frames[id as usize].order > order {
			let new_order = self.frames[id as usize].order - 1;
			self.frames[id as usize].order = new_order;
			// Get buddy identifier
			let buddy = id ^ (1 << new_order);
			if buddy >= self.pages_count() {
				break;
			}
			// Update buddy
			let buddy_frame = &mut self.frames[buddy as usize];
			buddy_frame.mark_free(buddy);
			buddy_frame.order = new_order;
			self.link(buddy);
		}
	}

	/// Coalesces the block headed by frame `id` with free buddy blocks
	/// recursively until no buddy is available anymore, then links the result
	/// to the free list.
	///
	/// The frame must not be marked as used.
	fn coalesce(&mut self, mut id: FrameId) {
		debug_assert!(!self.frames[id as usize].is_used());
		loop {
			let order = self.frames[id as usize].order;
			if order >= MAX_ORDER {
				break;
			}
			// Get buddy identifier
			let buddy = id ^ (1 << order);
			if buddy >= self.pages_count() {
				break;
			}
			// Check if coalesce is possible
			let new_pages = 1 << (order + 1);
			if id.min(buddy) + new_pages > self.pages_count() {
				break;
			}
			let buddy_frame = &self.frames[buddy as usize];
			if buddy_frame.is_used() || buddy_frame.order != order {
				break;
			}
			self.unlink(buddy);
			let head = id.min(buddy);
			self.frames[head as usize].order = order + 1;
			id = head;
		}
		self.link(id);
	}

	/// Checks the correctness of the free list for the zone.
	///
	/// Every frame in the free list must have an order equal to the order of
	/// the bucket it is inserted in and must be free. If a frame is the first
	/// of a list, it must not have a previous element.
	#[cfg(debug_assertions)]
	fn check_free_list(&self) {
		for (order, list) in self.free_list.iter().enumerate() {
			let Some(first) = *list else {
				continue;
			};
			let mut id = first;
			let mut is_first = true;
			loop {
				let frame = &self.frames[id as usize];
				debug_assert!(!frame.is_used());
				debug_assert_eq!(frame.order, order as FrameOrder);
				debug_assert!(!is_first || frame.prev == id);
				debug_assert!(id + (1 << order) <= self.pages_count());
				if frame.next == id {
					break;
				}
				id = frame.next;
				is_first = false;
			}
		}
	}
}

/// The zone allocator and page frame database.
pub(crate) struct FrameAllocator {
	/// The zones, in allocation search order: user first, kernel second.
	zones: [Zone; ZONES_COUNT],
}

impl FrameAllocator {
	/// Creates the allocator with a kernel zone of `kernel_pages` pages
	/// starting at the 1 MiB boundary and a user zone of `user_pages` pages
	/// right after it.
	pub fn new(kernel_pages: usize, user_pages: usize) -> Self {
		let kernel = Zone::new("kernel", LOWMEM_BEGIN, kernel_pages);
		let user = Zone::new(
			"user",
			LOWMEM_BEGIN + kernel_pages * PAGE_SIZE,
			user_pages,
		);
		Self {
			zones: [user, kernel],
		}
	}

	/// Returns the physical range `(begin, pages)` of every zone.
	pub fn zone_ranges(&self) -> [(PhysAddr, usize); ZONES_COUNT] {
		[
			(self.zones[0].begin, self.zones[0].frames.len()),
			(self.zones[1].begin, self.zones[1].frames.len()),
		]
	}

	fn zone_for(&self, addr: PhysAddr) -> &Zone {
		self.zones
			.iter()
			.find(|z| z.contains(addr))
			.expect("physical address outside of every zone")
	}

	fn zone_for_mut(&mut self, addr: PhysAddr) -> &mut Zone {
		self.zones
			.iter_mut()
			.find(|z| z.contains(addr))
			.expect("physical address outside of every zone")
	}

	/// Allocates a block of `2^order` contiguous frames.
	///
	/// Every frame of the block starts with a reference count of `1`.
	///
	/// On success, the function returns the physical address of the first
	/// frame of the block.
	pub fn alloc(&mut self, order: FrameOrder, flags: GfpFlags) -> AllocResult<PhysAddr> {
		if order > MAX_ORDER {
			return Err(AllocError);
		}
		// Select a zone and frame to allocate on
		let begin_zone = if flags.contains(GfpFlags::USER) { 0 } else { 1 };
		let (zone, id) = self.zones[begin_zone..]
			.iter_mut()
			.find_map(|z| {
				let id = z.get_available_frame(order)?;
				Some((z, id))
			})
			.ok_or(AllocError)?;
		// Do the actual allocation
		zone.split(id, order);
		let frame = &mut zone.frames[id as usize];
		frame.order = order;
		frame.mark_used();
		let pages = 1usize << order;
		for off in 0..pages {
			let f = &mut zone.frames[id as usize + off];
			debug_assert_eq!(f.ref_count.load(Relaxed), 0);
			f.ref_count.store(1, Relaxed);
			f.order = order;
			f.head_off = off as u16;
			if off > 0 {
				f.mark_used();
			}
		}
		zone.allocated_pages += pages;
		Ok(zone.frame_addr(id))
	}

	/// Frees the block of frames starting at `addr`.
	///
	/// `addr` must be the address of the head of a block returned by
	/// [`Self::alloc`].
	///
	/// If the head frame has a reference count above `1`, the block is
	/// shared: the function drops one reference from each frame and leaves
	/// the memory allocated.
	pub fn free(&mut self, addr: PhysAddr) {
		debug_assert!(addr.is_aligned_to(PAGE_SIZE));
		let zone = self.zone_for_mut(addr);
		let id = zone.frame_id(addr);
		let frame = &zone.frames[id as usize];
		debug_assert!(frame.is_used());
		debug_assert_eq!(frame.head_off, 0);
		let order = frame.order;
		let pages = 1usize << order;
		if frame.ref_count.load(Relaxed) > 1 {
			// The block is shared, only drop one reference
			for off in 0..pages {
				let prev = zone.frames[id as usize + off].ref_count.fetch_sub(1, Relaxed);
				debug_assert!(prev > 0);
			}
			return;
		}
		for off in 0..pages {
			let f = &zone.frames[id as usize + off];
			debug_assert!(f.ref_count.load(Relaxed) <= 1);
			f.ref_count.store(0, Relaxed);
		}
		zone.frames[id as usize].mark_free(id);
		zone.coalesce(id);
		zone.allocated_pages -= pages;
		#[cfg(debug_assertions)]
		zone.check_free_list();
	}

	/// Increments the reference count of the frame at `addr`.
	pub fn frame_inc(&self, addr: PhysAddr) {
		let zone = self.zone_for(addr);
		let id = zone.frame_id(addr);
		zone.frames[id as usize].ref_count.fetch_add(1, Relaxed);
	}

	/// Returns the reference count of the frame at `addr`.
	pub fn frame_count(&self, addr: PhysAddr) -> u32 {
		let zone = self.zone_for(addr);
		let id = zone.frame_id(addr);
		zone.frames[id as usize].ref_count.load(Relaxed)
	}

	/// Drops one reference from the single frame at `addr`.
	///
	/// When every frame of the block has dropped to zero references, the
	/// block is released back to the free list.
	pub fn release_page(&mut self, addr: PhysAddr) {
		let zone = self.zone_for_mut(addr);
		let id = zone.frame_id(addr);
		let frame = &zone.frames[id as usize];
		debug_assert!(frame.is_used());
		let prev = frame.ref_count.fetch_sub(1, Relaxed);
		debug_assert!(prev > 0);
		// Release the whole block once no frame of it is referenced anymore
		let head = id - frame.head_off as FrameId;
		let order = frame.order;
		let pages = 1usize << order;
		let empty = (0..pages)
			.all(|off| zone.frames[head as usize + off].ref_count.load(Relaxed) == 0);
		if empty {
			zone.frames[head as usize].order = order;
			zone.frames[head as usize].mark_free(head);
			zone.coalesce(head);
			zone.allocated_pages -= pages;
		}
	}

	/// Returns the head address and the order of the block containing the
	/// frame at `addr`.
	pub fn block_of(&self, addr: PhysAddr) -> (PhysAddr, FrameOrder) {
		let zone = self.zone_for(addr);
		let id = zone.frame_id(addr);
		let frame = &zone.frames[id as usize];
		debug_assert!(frame.is_used());
		let head = id - frame.head_off as FrameId;
		(zone.frame_addr(head), frame.order)
	}

	/// Clears the reference counts of the frames past the first `keep` pages
	/// of the block at `addr`.
	///
	/// This is used when a block is rounded up past the size actually
	/// mapped: the tail frames are never referenced by any mapping, and the
	/// block must still be reclaimable once every mapped frame is released.
	pub fn drop_tail(&mut self, addr: PhysAddr, keep: usize) {
		let zone = self.zone_for_mut(addr);
		let id = zone.frame_id(addr);
		debug_assert_eq!(zone.frames[id as usize].head_off, 0);
		let pages = 1usize << zone.frames[id as usize].order;
		for off in keep..pages {
			zone.frames[id as usize + off].ref_count.store(0, Relaxed);
		}
	}

	/// Returns the total number of pages allocated by the buddy allocator.
	pub fn allocated_pages_count(&self) -> usize {
		self.zones.iter().map(|z| z.allocated_pages).sum()
	}

	/// Returns the total number of pages managed by the allocator.
	pub fn total_pages(&self) -> usize {
		self.zones.iter().map(|z| z.frames.len()).sum()
	}

	/// Returns an immutable slice over the physical memory at `addr`.
	pub fn slice(&self, addr: PhysAddr, len: usize) -> &[u8] {
		let zone = self.zone_for(addr);
		let off = addr - zone.begin;
		&zone.mem[off..off + len]
	}

	/// Returns a mutable slice over the physical memory at `addr`.
	pub fn slice_mut(&mut self, addr: PhysAddr, len: usize) -> &mut [u8] {
		let zone = self.zone_for_mut(addr);
		let off = addr - zone.begin;
		&mut zone.mem[off..off + len]
	}

	/// Fills `len` bytes of physical memory at `addr` with `byte`.
	pub fn fill(&mut self, addr: PhysAddr, len: usize, byte: u8) {
		self.slice_mut(addr, len).fill(byte);
	}

	/// Copies one page of physical memory from `src` to `dst`.
	pub fn copy_page(&mut self, dst: PhysAddr, src: PhysAddr) {
		let mut buf = [0u8; PAGE_SIZE];
		buf.copy_from_slice(self.slice(src, PAGE_SIZE));
		self.slice_mut(dst, PAGE_SIZE).copy_from_slice(&buf);
	}
}

/// Returns the size in bytes of a block with the given order `order`.
#[inline]
pub fn get_block_size(order: FrameOrder) -> usize {
	PAGE_SIZE << order
}

/// Returns the buddy order required to fit the given number of pages.
#[inline]
pub fn get_order(pages: usize) -> FrameOrder {
	if pages <= 1 {
		return 0;
	}
	(usize::BITS - (pages - 1).leading_zeros()) as FrameOrder
}

#[cfg(test)]
mod test {
	use super::*;
	use std::collections::BTreeSet;

	fn new_allocator() -> FrameAllocator {
		FrameAllocator::new(128, 128)
	}

	#[test]
	fn order() {
		assert_eq!(get_order(0), 0);
		assert_eq!(get_order(1), 0);
		assert_eq!(get_order(2), 1);
		assert_eq!(get_order(3), 2);
		assert_eq!(get_order(4), 2);
		assert_eq!(get_order(5), 3);
		assert_eq!(get_order(1024), 10);
	}

	#[test]
	fn buddy0() {
		let mut fa = new_allocator();
		let base = fa.allocated_pages_count();
		let p = fa.alloc(0, GfpFlags::KERNEL).unwrap();
		fa.fill(p, PAGE_SIZE, !0);
		assert_eq!(fa.allocated_pages_count(), base + 1);
		assert_eq!(fa.frame_count(p), 1);
		fa.free(p);
		assert_eq!(fa.allocated_pages_count(), base);
	}

	#[test]
	fn buddy1() {
		let mut fa = new_allocator();
		let base = fa.allocated_pages_count();
		let p = fa.alloc(1, GfpFlags::KERNEL).unwrap();
		fa.fill(p, get_block_size(1), !0);
		assert_eq!(fa.allocated_pages_count(), base + 2);
		fa.free(p);
		assert_eq!(fa.allocated_pages_count(), base);
	}

	#[test]
	fn buddy_free() {
		// The allocator shall reuse the block freed last
		let mut fa = new_allocator();
		let first = {
			let p = fa.alloc(0, GfpFlags::KERNEL).unwrap();
			fa.free(p);
			p
		};
		for _ in 0..100 {
			let p = fa.alloc(0, GfpFlags::KERNEL).unwrap();
			assert_eq!(p, first);
			fa.free(p);
		}
	}

	#[test]
	fn buddy_fifo() {
		let mut fa = new_allocator();
		let base = fa.allocated_pages_count();
		let mut blocks = [PhysAddr(0); 64];
		for b in &mut blocks {
			*b = fa.alloc(0, GfpFlags::KERNEL).unwrap();
		}
		for b in blocks {
			fa.free(b);
		}
		assert_eq!(fa.allocated_pages_count(), base);
	}

	#[test]
	fn buddy_full_duplicate() {
		// Exhaust a zone and check no block is handed out twice
		let mut fa = new_allocator();
		let mut seen = BTreeSet::new();
		let mut blocks = Vec::new();
		while let Ok(p) = fa.alloc(0, GfpFlags::USER) {
			assert!(seen.insert(p));
			blocks.push(p);
		}
		assert_eq!(fa.allocated_pages_count(), fa.total_pages());
		for p in blocks {
			fa.free(p);
		}
		assert_eq!(fa.allocated_pages_count(), 0);
	}

	#[test]
	fn buddy_zones() {
		let mut fa = new_allocator();
		let kernel = fa.alloc(0, GfpFlags::KERNEL).unwrap();
		let user = fa.alloc(0, GfpFlags::USER).unwrap();
		assert!(kernel < user);
		fa.free(kernel);
		fa.free(user);
	}

	#[test]
	fn shared_free() {
		let mut fa = new_allocator();
		let base = fa.allocated_pages_count();
		let p = fa.alloc(1, GfpFlags::USER).unwrap();
		fa.frame_inc(p);
		fa.frame_inc(p + PAGE_SIZE);
		assert_eq!(fa.frame_count(p), 2);
		// First free only drops the extra references
		fa.free(p);
		assert_eq!(fa.frame_count(p), 1);
		assert_eq!(fa.allocated_pages_count(), base + 2);
		fa.free(p);
		assert_eq!(fa.allocated_pages_count(), base);
	}

	#[test]
	fn release_single_pages() {
		let mut fa = new_allocator();
		let base = fa.allocated_pages_count();
		let p = fa.alloc(2, GfpFlags::USER).unwrap();
		assert_eq!(fa.block_of(p + 2 * PAGE_SIZE), (p, 2));
		// Release frames one by one; the block goes back only with the last
		for i in 0..3 {
			fa.release_page(p + i * PAGE_SIZE);
			assert_eq!(fa.allocated_pages_count(), base + 4);
		}
		fa.release_page(p + 3 * PAGE_SIZE);
		assert_eq!(fa.allocated_pages_count(), base);
	}

	#[test]
	fn drop_tail_reclaim() {
		let mut fa = new_allocator();
		let base = fa.allocated_pages_count();
		// Order 2 block backing only 3 mapped pages
		let p = fa.alloc(2, GfpFlags::USER).unwrap();
		fa.drop_tail(p, 3);
		for i in 0..3 {
			fa.release_page(p + i * PAGE_SIZE);
		}
		assert_eq!(fa.allocated_pages_count(), base);
	}

	#[test]
	fn phys_access() {
		let mut fa = new_allocator();
		let a = fa.alloc(0, GfpFlags::KERNEL).unwrap();
		let b = fa.alloc(0, GfpFlags::KERNEL).unwrap();
		fa.fill(a, PAGE_SIZE, 0x5a);
		fa.copy_page(b, a);
		assert!(fa.slice(b, PAGE_SIZE).iter().all(|b| *b == 0x5a));
		fa.free(a);
		fa.free(b);
	}
}
