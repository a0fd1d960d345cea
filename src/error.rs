//! Error handling for the checker core.
//!
//! This workspace's sibling CLI tools never pull in `thiserror`/`anyhow`;
//! binaries convert `io::Result` into a `prog: message` line on stderr and
//! exit (see `utils::error`). This module follows the same shape: a small
//! hand-written error enum whose variants are exactly the discriminants this
//! checker's failure taxonomy needs, plus a `fatal` helper matching
//! `utils::error`'s print-then-exit pattern.

use std::fmt;
use std::io;
use std::process::exit;

/// The taxonomy of errors a pass can raise: `IO`, `Corrupt`, `BadRange`,
/// `Internal`, `UserCancelled`, `NoMem`.
#[derive(Debug)]
pub enum CheckError {
	/// A read or write to the device failed.
	Io(io::Error),
	/// A signature, magic number, or checksum did not match what was
	/// expected.
	Corrupt(String),
	/// A value was outside of the range the volume permits (out-of-range
	/// block/cluster number, a count exceeding its maximum, ...).
	BadRange(String),
	/// A post-condition of an internal helper was violated. Always fatal.
	Internal(String),
	/// The user declined a repair that was required to continue.
	Cancelled,
	/// Allocation failed. Always fatal.
	NoMem,
}

impl CheckError {
	/// Tells whether this error must abort the whole run rather than let
	/// the current pass continue to the next item.
	pub fn is_fatal(&self) -> bool {
		matches!(self, CheckError::Internal(_) | CheckError::NoMem)
	}

	pub fn corrupt<M: Into<String>>(msg: M) -> Self {
		CheckError::Corrupt(msg.into())
	}

	pub fn bad_range<M: Into<String>>(msg: M) -> Self {
		CheckError::BadRange(msg.into())
	}

	pub fn internal<M: Into<String>>(msg: M) -> Self {
		CheckError::Internal(msg.into())
	}
}

impl fmt::Display for CheckError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CheckError::Io(e) => write!(f, "I/O error: {e}"),
			CheckError::Corrupt(m) => write!(f, "corruption detected: {m}"),
			CheckError::BadRange(m) => write!(f, "value out of range: {m}"),
			CheckError::Internal(m) => write!(f, "internal error: {m}"),
			CheckError::Cancelled => write!(f, "cancelled by user"),
			CheckError::NoMem => write!(f, "out of memory"),
		}
	}
}

impl std::error::Error for CheckError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			CheckError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for CheckError {
	fn from(e: io::Error) -> Self {
		CheckError::Io(e)
	}
}

/// Result alias used throughout the core.
pub type CheckResult<T> = Result<T, CheckError>;

/// Prints a diagnostic to stderr and terminates the process.
///
/// Used for the small set of errors that are unconditionally fatal:
/// allocation failure and superblock-level I/O failure. Mirrors
/// `utils::error` in this workspace's sibling CLI tools, which does the same
/// for its CLI tools. Exit codes follow the same 0/1/2/4/8/16/32/128 table
/// `src/bin/fsck.rs` uses for the rest of the run: 8 = operational error,
/// 32 = cancelled, 128 = internal/library error.
pub fn fatal(bin: &str, err: &CheckError) -> ! {
	eprintln!("{bin}: error: {err}");
	exit(match err {
		CheckError::NoMem => 8,
		CheckError::Cancelled => 32,
		CheckError::Internal(_) => 128,
		_ => 8,
	});
}
