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

//! Kernel error numbers.
//!
//! User-origin failures travel as [`Errno`] values up to the faulting task;
//! kernel-origin invariant violations panic instead of returning.

use core::fmt;

/// An Unix error number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Errno(pub i32);

/// Operation not permitted.
pub const EPERM: Errno = Errno(1);
/// No such file or directory.
pub const ENOENT: Errno = Errno(2);
/// No such process.
pub const ESRCH: Errno = Errno(3);
/// Try again.
pub const EAGAIN: Errno = Errno(11);
/// Out of memory.
pub const ENOMEM: Errno = Errno(12);
/// Bad address.
pub const EFAULT: Errno = Errno(14);
/// Device or resource busy.
pub const EBUSY: Errno = Errno(16);
/// File exists.
pub const EEXIST: Errno = Errno(17);
/// Invalid argument.
pub const EINVAL: Errno = Errno(22);
/// Function not implemented.
pub const ENOSYS: Errno = Errno(38);

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "errno {}", self.0)
	}
}

/// Result type for operations whose failures are reported to the caller.
pub type EResult<T> = Result<T, Errno>;

/// An out-of-memory condition from the zone or slab allocator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocError;

/// Result type for allocations.
pub type AllocResult<T> = Result<T, AllocError>;

impl From<AllocError> for Errno {
	fn from(_: AllocError) -> Self {
		ENOMEM
	}
}
