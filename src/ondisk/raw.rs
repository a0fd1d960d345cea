//! Raw struct (de)serialization for `#[repr(C, packed)]` on-disk structures.
//!
//! Grounded in `mkfs/src/ext2.rs`'s direct use of `slice::from_raw_parts[_mut]`
//! to read/write `Superblock`/`BlockGroupDescriptor` as raw bytes (see its
//! `BlockGroupDescriptor::read`/`write` and `Ext2Factory::create_fs`). That
//! pattern is lifted here into two generic helpers so every `ondisk` struct
//! shares one (de)serialization path instead of repeating the unsafe cast at
//! each call site.

use std::io::{self, Read, Write};
use std::mem::size_of;
use std::slice;

/// Reads a `T` from `r` by filling its raw bytes. Safe to call only for `T:
/// Pod` (plain-old-data: `#[repr(C, packed)]`, no padding, no invalid bit
/// patterns, e.g. no `bool`/enum/reference fields) — every `ondisk` struct
/// that calls this upholds that by construction.
pub fn read_struct<T: Copy, R: Read + ?Sized>(r: &mut R) -> io::Result<T> {
	let mut val: T = unsafe { std::mem::zeroed() };
	let slice = unsafe { slice::from_raw_parts_mut(&mut val as *mut T as *mut u8, size_of::<T>()) };
	r.read_exact(slice)?;
	Ok(val)
}

/// Writes `val`'s raw bytes to `w`. See [`read_struct`] for the `Pod`
/// requirement this relies on.
pub fn write_struct<T: Copy, W: Write + ?Sized>(w: &mut W, val: &T) -> io::Result<()> {
	let slice = unsafe { slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) };
	w.write_all(slice)
}

/// Views `val`'s raw bytes without copying, for in-place checksum or
/// pass-through-I/O use.
pub fn as_bytes<T: Copy>(val: &T) -> &[u8] {
	unsafe { slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) }
}
