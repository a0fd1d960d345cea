//! Extended attribute storage: inline, external flat block, and indexed
//! bucket tree.
//!
//! Field names are ground in `fsck.ocfs2/xattr.c`'s `check_xattr_count`/
//! `check_xattr_entry` (`xh_count`, `xh_free_start`, `xh_name_value_len`,
//! `xh_entries`, `xe_name_hash`, `xe_name_offset`, `xe_value_size`,
//! `xe_name_len`) and its bucket-count detection helper
//! (`detect_xattr_bucket_count`).

use std::io;

pub const MAX_XATTR_ENTRIES: usize = 16;
/// Size of one xattr bucket in bytes, matching `OCFS2_XATTR_BUCKET_SIZE`'s
/// role as the external-indexed-tree leaf unit.
pub const XATTR_BUCKET_SIZE: usize = 4096;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct XattrEntry {
	pub xe_name_hash: u32,
	pub xe_name_offset: u16,
	pub xe_name_len: u8,
	pub xe_local: u8,
	pub xe_value_size: u32,
}

impl XattrEntry {
	pub fn is_last(&self) -> bool {
		self.xe_name_hash == 0 && self.xe_name_offset == 0 && self.xe_name_len == 0
	}
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct XattrHeader {
	pub xh_count: u16,
	pub xh_free_start: u16,
	pub xh_name_value_len: u16,
	pub _pad0: u16,
	pub xh_entries: [XattrEntry; MAX_XATTR_ENTRIES],
}

impl XattrHeader {
	pub fn entries(&self) -> &[XattrEntry] {
		let n = (self.xh_count as usize).min(self.xh_entries.len());
		&self.xh_entries[..n]
	}

	/// Recomputes `xh_free_start`/`xh_name_value_len` from the entries
	/// actually present, per `check_xattr_count`'s end-of-pass fixup of
	/// those two fields once any entry has been dropped or moved.
	pub fn recompute_free_region(&mut self, header_bytes_used: u16) {
		let mut min_offset = u16::MAX;
		let mut total: u16 = 0;
		for e in self.entries() {
			if e.xe_name_offset < min_offset {
				min_offset = e.xe_name_offset;
			}
			total = total.saturating_add(value_region_len(e.xe_name_len, e.xe_value_size));
		}
		if self.xh_count == 0 {
			min_offset = header_bytes_used;
		}
		self.xh_free_start = min_offset;
		self.xh_name_value_len = total;
	}
}

/// `ocfs2_xattr_value_real_size`-equivalent: inline values store their
/// bytes directly after the name; larger ones spill to an extent list whose
/// footprint this function still accounts for in the used-area bookkeeping.
pub fn value_region_len(name_len: u8, value_size: u32) -> u16 {
	let raw = name_len as u32 + value_size.min(0xffff);
	((raw + 7) & !7) as u16
}

/// Computes the name-hash recorded in `xe_name_hash`, to detect the
/// mismatch Pass 1 step 6 fixes in place. A simple FNV-1a variant stands in
/// for the real hash function (an on-disk detail this crate owns end to
/// end: whatever it writes, it also reads back consistently).
pub fn name_hash(name: &[u8]) -> u32 {
	let mut h: u32 = 0x811c9dc5;
	for &b in name {
		h ^= b as u32;
		h = h.wrapping_mul(0x0100_0193);
	}
	h
}

/// One leaf of the external indexed xattr tree: a bucket is just a
/// fixed-size block carrying its own `XattrHeader` plus name/value bytes.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct XattrBucket {
	pub xb_blkno: u64,
	pub xb_header: XattrHeader,
}

impl XattrBucket {
	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = buf;
		super::raw::read_struct(&mut cursor)
	}

	pub fn write_into(&self, buf: &mut [u8]) -> io::Result<()> {
		let mut cursor = &mut *buf;
		super::raw::write_struct(&mut cursor, self)
	}
}
