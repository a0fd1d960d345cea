//! Chain allocators: the global and per-slot inode/cluster allocators that
//! Pass 0 verifies before any later pass trusts them.
//!
//! Grounded in `fsck.ocfs2/pass0.c`'s `check_chain`/`check_group_desc` (the
//! exact fields those functions inspect: signature, `bg_parent_dinode`,
//! `bg_generation`, `bg_blkno`, `bg_chain`, `bg_free_bits_count`,
//! `bg_bits_count`, `bg_next_group`), generalized from this workspace's single
//! flat block-group bitmap (`mkfs/src/ext2.rs::BlockGroupDescriptor`) to a
//! chain-of-chains structure.

use super::raw::{read_struct, write_struct};
use std::io;

pub const GROUP_DESC_SIGNATURE: [u8; 4] = *b"GRDE";

/// One chain's head: the block number of its first group descriptor.
/// `fsck.ocfs2/pass0.c::check_chain` walks the singly-linked list of
/// descriptors starting here.
pub const MAX_CHAINS: usize = 64;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ChainRec {
	pub c_free: u32,
	pub c_total: u32,
	pub c_blkno: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ChainList {
	pub cl_count: u16,
	pub cl_next_free_rec: u16,
	pub cl_cpg: u16,
	pub _pad0: [u8; 2],
	pub recs: [ChainRec; MAX_CHAINS],
}

impl ChainList {
	pub fn chains(&self) -> &[ChainRec] {
		let n = (self.cl_next_free_rec as usize).min(self.recs.len());
		&self.recs[..n]
	}

	/// Clamps `cl_count` to `max` and `cl_next_free_rec` to the clamped
	/// `cl_count`, matching Pass 0's "clamp count to the maximum permitted
	/// by the block size; clamp next-free-rec to count".
	pub fn clamp(&mut self, max_count: u16) -> bool {
		let mut changed = false;
		if self.cl_count > max_count {
			self.cl_count = max_count;
			changed = true;
		}
		if self.cl_next_free_rec > self.cl_count {
			self.cl_next_free_rec = self.cl_count;
			changed = true;
		}
		changed
	}

	/// Deletes chain `idx` by moving the last valid record into its slot
	/// and decrementing `cl_next_free_rec`, per Pass 0's "delete the chain
	/// record... and compact the chain array".
	pub fn remove_chain(&mut self, idx: usize) {
		let n = self.cl_next_free_rec as usize;
		assert!(idx < n, "remove_chain index out of range");
		let last = n - 1;
		if idx != last {
			self.recs[idx] = self.recs[last];
		}
		self.recs[last] = ChainRec { c_free: 0, c_total: 0, c_blkno: 0 };
		self.cl_next_free_rec -= 1;
	}
}

/// One group descriptor in a chain: a bitmap header plus the fields Pass 0
/// cross-checks against its owning allocator.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GroupDesc {
	pub bg_signature: [u8; 4],
	pub bg_generation: u32,
	pub bg_parent_dinode: u64,
	pub bg_blkno: u64,
	pub bg_chain: u16,
	pub _pad0: u16,
	pub bg_free_bits_count: u32,
	pub bg_bits_count: u32,
	pub bg_next_group: u64,
}

impl GroupDesc {
	pub fn has_signature(&self) -> bool {
		self.bg_signature == GROUP_DESC_SIGNATURE
	}

	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = buf;
		read_struct(&mut cursor)
	}

	pub fn write_into(&self, buf: &mut [u8]) -> io::Result<()> {
		let mut cursor = &mut *buf;
		write_struct(&mut cursor, self)
	}
}
