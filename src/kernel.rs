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

//! The memory-management and process-image core of the MentOS kernel.
//!
//! The crate carries the subsystems every other part of the kernel leans on:
//! - The page frame database and zone allocator ([`memory::buddy`])
//! - The slab cache backing every kernel object ([`memory::cache`])
//! - The two-level page-table walker and the MMU interface ([`memory::vmem`])
//! - Per-process address spaces, the virtual memory areas composing them, the
//!   page-fault handler and the copy-on-write engine ([`process::mem_space`])
//!
//! The hardware side (physical memory, control registers and the TLB) is
//! modelled explicitly so that the whole core runs and is tested on a host:
//! physical memory is an arena owned by the zone allocator, and address
//! translation goes through a TLB that is only coherent if every mapping
//! change is followed by the single-entry invalidation the real MMU requires.
//!
//! Process-wide state lives in an explicit [`memory::MemoryCore`] context
//! which is passed through the kernel instead of module globals.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod errno;
pub mod memory;
pub mod process;
pub mod syscall;
