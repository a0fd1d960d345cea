//! Miscellaneous helpers shared across passes.
//!
//! Ported and generalized from this workspace's `utils::util` (`log2`,
//! `ceil_division`-equivalent arithmetic, `ByteSize`) plus the `verbosef`
//! logging shape from `fsck.ocfs2/include/fsck.h`.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current timestamp since the Unix epoch.
///
/// See `utils::util::get_timestamp` in this workspace's sibling CLI tools.
pub fn get_timestamp() -> Duration {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before the Unix epoch")
}

/// Integer division rounding up. Used throughout the on-disk format to
/// compute bitmap and table sizes in blocks.
pub fn ceil_division(n: u64, d: u64) -> u64 {
	(n + d - 1) / d
}

/// Performs `log2` on the given integer, returning `None` if `n` is zero.
///
/// See `utils::util::log2` in this workspace's sibling CLI tools.
pub fn log2(n: u64) -> Option<u32> {
	if n == 0 {
		None
	} else {
		Some(63 - n.leading_zeros())
	}
}

/// Returns `2^n`.
pub fn pow2(n: u32) -> u64 {
	1u64 << n
}

/// Structure representing a number of bytes, for human-readable reporting.
///
/// See `utils::util::ByteSize` in this workspace's sibling CLI tools.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut order = log2(self.0.max(1)).unwrap_or(0) / log2(1024).unwrap();
		let suffix = match order {
			0 => "bytes",
			1 => "KiB",
			2 => "MiB",
			3 => "GiB",
			4 => "TiB",
			5 => "PiB",
			_ => {
				order = 0;
				"bytes"
			}
		};
		let unit = 1024u64.pow(order);
		write!(f, "{} {}", self.0 / unit, suffix)
	}
}

/// Prints a diagnostic to stderr only when `verbose` is set.
///
/// This crate carries no logging crate dependency; `fsck.ocfs2/include/fsck.h`'s
/// `verbosef()` macro (gated on a global `verbose` flag) is the closest
/// upstream analogue, and that's the shape reproduced here rather than
/// introducing `log`/`tracing`.
#[macro_export]
macro_rules! verbosef {
	($state:expr, $($arg:tt)*) => {
		if $state.verbose {
			eprint!("{}:{} | ", module_path!(), line!());
			eprintln!($($arg)*);
		}
	};
}
