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

//! Process-facing entry points of the memory core.
//!
//! The scheduler, signal delivery and task bookkeeping live outside of this
//! crate; they are consumed through the [`Scheduler`] trait. The page-fault
//! entry point resolves the fault against the current task's memory space
//! and, when the access is illegal, posts `SIGSEGV` and re-enters the
//! scheduler so the signal can be serviced. A direct kill would skip the
//! task's signal handlers.

pub mod mem_space;

use crate::memory::MemoryCore;
use log::debug;
use mem_space::{FaultOutcome, MemSpace};

/// A process identifier.
pub type Pid = i32;

/// The signals the memory core may post.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
	/// Invalid memory reference.
	SIGSEGV,
	/// Bus error.
	SIGBUS,
	/// Killed.
	SIGKILL,
}

/// A saved register frame, as pushed by the fault gate.
#[derive(Clone, Copy, Debug, Default)]
pub struct Regs {
	/// The instruction pointer at the time of the fault.
	pub eip: usize,
	/// The stack pointer at the time of the fault.
	pub esp: usize,
	/// The hardware error code pushed by the exception.
	pub err_code: u32,
}

/// The scheduler interface consumed by the fault handler.
pub trait Scheduler {
	/// Returns the PID of the running process.
	fn get_current_process(&mut self) -> Pid;

	/// Returns the memory space of the running process.
	fn current_mem_space(&mut self) -> &mut MemSpace;

	/// Posts the signal `signal` to the process `pid`.
	fn sys_kill(&mut self, pid: Pid, signal: Signal);

	/// Picks the next task to run and returns to it through `regs`.
	fn run(&mut self, regs: &mut Regs);
}

/// The page-fault handler, registered on the architecture's fault gate.
///
/// The faulting address comes from the MMU's fault register; the error code
/// comes with the saved register frame. If the fault cannot be resolved,
/// `SIGSEGV` is posted to the current task and the scheduler is re-entered.
/// Kernel faults panic inside the resolution itself.
pub fn page_fault_handler(core: &mut MemoryCore, sched: &mut dyn Scheduler, regs: &mut Regs) {
	let addr = core.fault_address();
	let code = regs.err_code;
	let outcome = sched.current_mem_space().handle_page_fault(core, addr, code);
	match outcome {
		FaultOutcome::Resolved => {}
		FaultOutcome::Segv => {
			let pid = sched.get_current_process();
			debug!("posting SIGSEGV to pid {pid} for fault at {addr:?}");
			sched.sys_kill(pid, Signal::SIGSEGV);
			sched.run(regs);
		}
	}
}
