//! Per-slot journal on-disk structures.
//!
//! Field names ground directly in `examples/original_source/fsck.ocfs2/journal.c`:
//! `journal_superblock_t`'s `s_start`/`s_sequence`/`s_maxlen`/`s_first`,
//! `journal_header_t`'s `h_magic`/`h_blocktype`/`h_sequence`, the descriptor
//! tag's `t_blocknr`/`t_flags` (`JFS_FLAG_ESCAPE`/`JFS_FLAG_LAST_TAG`/
//! `JFS_FLAG_SAME_UUID`), and the revoke block's `r_count`. This is a
//! distinct module from the replay *algorithm* in `src/journal.rs`, which
//! consumes these types but does not define them — mirroring the original's
//! split between on-disk layout (`jfs_compat.h`) and replay logic
//! (`journal.c`).

use std::io;

pub const JOURNAL_MAGIC: u32 = 0xc03b_3998;

pub const BLOCKTYPE_DESCRIPTOR: u32 = 1;
pub const BLOCKTYPE_COMMIT: u32 = 2;
pub const BLOCKTYPE_SUPERBLOCK_V2: u32 = 4;
pub const BLOCKTYPE_REVOKE: u32 = 5;

pub const TAG_FLAG_ESCAPE: u32 = 0x1;
pub const TAG_FLAG_SAME_UUID: u32 = 0x2;
pub const TAG_FLAG_LAST_TAG: u32 = 0x8;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct JournalHeader {
	pub h_magic: u32,
	pub h_blocktype: u32,
	pub h_sequence: u32,
}

impl JournalHeader {
	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = &buf[..12];
		super::raw::read_struct(&mut cursor)
	}

	pub fn has_magic(&self) -> bool {
		self.h_magic == JOURNAL_MAGIC
	}
}

/// `DIRTY_FL` on the journal inode this superblock belongs to; tested by
/// `should_replay` against the owning `DInode::i_flags`, not stored here.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct JournalSuperblock {
	pub header: JournalHeader,
	pub s_blocksize: u32,
	pub s_maxlen: u32,
	pub s_first: u32,
	pub s_sequence: u32,
	pub s_start: u32,
}

impl JournalSuperblock {
	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = buf;
		super::raw::read_struct(&mut cursor)
	}

	pub fn write_into(&self, buf: &mut [u8]) -> io::Result<()> {
		let mut cursor = &mut *buf;
		super::raw::write_struct(&mut cursor, self)
	}

	/// `s_start == 0` means the journal has nothing to replay.
	pub fn needs_replay(&self) -> bool {
		self.s_start != 0
	}
}

/// One tag in a descriptor block, naming a logical journal block's target
/// disk block and replay flags.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BlockTag {
	pub t_blocknr: u64,
	pub t_flags: u32,
	pub _pad0: u32,
}

impl BlockTag {
	pub const ENCODED_LEN: usize = 16;

	pub fn is_escaped(&self) -> bool {
		self.t_flags & TAG_FLAG_ESCAPE != 0
	}

	pub fn is_last_tag(&self) -> bool {
		self.t_flags & TAG_FLAG_LAST_TAG != 0
	}

	pub fn same_uuid(&self) -> bool {
		self.t_flags & TAG_FLAG_SAME_UUID != 0
	}

	/// Reads one tag from `buf` at a given byte offset, returning `None`
	/// when not enough bytes remain for a full tag (the descriptor block
	/// boundary the scan loop bounds by
	/// `(block_size - header_size) / tag_size`).
	pub fn read_at(buf: &[u8], offset: usize) -> Option<Self> {
		if offset + Self::ENCODED_LEN > buf.len() {
			return None;
		}
		let mut cursor = &buf[offset..offset + Self::ENCODED_LEN];
		super::raw::read_struct(&mut cursor).ok()
	}
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RevokeHeader {
	pub header: JournalHeader,
	/// Total byte length of this block's used portion, including this
	/// header: `header_size <= r_count <= block_size`.
	pub r_count: u32,
}

impl RevokeHeader {
	pub const ENCODED_LEN: usize = 16;

	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = &buf[..Self::ENCODED_LEN];
		super::raw::read_struct(&mut cursor)
	}

	/// Returns the revoked block numbers packed after the header, given
	/// the validated `r_count`.
	pub fn revoked_blocks<'a>(&self, buf: &'a [u8]) -> impl Iterator<Item = u64> + 'a {
		let count = self.r_count as usize;
		let n = count.saturating_sub(Self::ENCODED_LEN) / 8;
		let body = &buf[Self::ENCODED_LEN..];
		(0..n).map(move |i| u64::from_be_bytes(body[i * 8..i * 8 + 8].try_into().unwrap()))
	}
}
