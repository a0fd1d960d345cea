//! Extent tree records.
//!
//! Generalizes this workspace's `mkfs/src/ext2.rs` block-pointer inode body
//! (direct/indirect block lists) to a cluster-granular extent tree, the
//! structure `fsck.ocfs2/include/extent.h`'s `struct extent_info` and
//! `o2fsck_check_extents`/`check_el` operate over (`ocfs2_extent_list`,
//! `ocfs2_extent_rec`, `ocfs2_extent_block`, fields `l_count`/
//! `l_next_free_rec`/`l_tree_depth`, `e_cpos`/`e_blkno`/`e_clusters`/
//! `e_leaf_clusters`, `h_blkno`).

use super::raw::{read_struct, write_struct};
use std::io;

/// Maximum extent records an inline list (embedded in a dinode or extent
/// block) can hold; the remainder of the block/dinode body is devoted to
/// other fields, so this is fixed by on-disk layout rather than computed.
pub const MAX_INLINE_EXTENT_RECS: usize = 32;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ExtentRec {
	/// Logical cluster offset within the owning inode/tree this record starts at.
	pub e_cpos: u32,
	/// Number of clusters at this extent's own granularity.
	pub e_clusters: u32,
	/// Number of clusters, after interior nodes are expanded to their leaves.
	pub e_leaf_clusters: u32,
	/// Physical starting block number.
	pub e_blkno: u64,
}

impl ExtentRec {
	pub fn is_empty(&self) -> bool {
		self.e_clusters == 0 && self.e_blkno == 0
	}
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ExtentList {
	/// Capacity of `recs` this list physically has room for.
	pub l_count: u16,
	/// Number of records in `recs` that are populated, starting at index 0.
	pub l_next_free_rec: u16,
	/// Depth of the tree rooted here; 0 means `recs` are leaves.
	pub l_tree_depth: u16,
	pub _pad0: u16,
	pub recs: [ExtentRec; MAX_INLINE_EXTENT_RECS],
}

impl ExtentList {
	pub fn records(&self) -> &[ExtentRec] {
		let n = (self.l_next_free_rec as usize).min(self.recs.len());
		&self.recs[..n]
	}

	pub fn records_mut(&mut self) -> &mut [ExtentRec] {
		let n = (self.l_next_free_rec as usize).min(self.recs.len());
		&mut self.recs[..n]
	}

	/// Removes the record at `idx`, shifting subsequent records left and
	/// zeroing the freed tail slot: the compaction rule for an out-of-range
	/// extent record.
	pub fn remove_record(&mut self, idx: usize) {
		let n = self.l_next_free_rec as usize;
		assert!(idx < n, "remove_record index out of range");
		for i in idx..n - 1 {
			self.recs[i] = self.recs[i + 1];
		}
		self.recs[n - 1] = ExtentRec { e_cpos: 0, e_clusters: 0, e_leaf_clusters: 0, e_blkno: 0 };
		self.l_next_free_rec -= 1;
	}

	/// Clamps `l_count` to `max` and `l_next_free_rec` to the (possibly
	/// just-clamped) `l_count`, per Pass 0/Pass 1's allocator- and
	/// extent-list repair rules.
	pub fn clamp(&mut self, max_count: u16) -> bool {
		let mut changed = false;
		if self.l_count > max_count {
			self.l_count = max_count;
			changed = true;
		}
		if self.l_next_free_rec > self.l_count {
			self.l_next_free_rec = self.l_count;
			changed = true;
		}
		changed
	}
}

/// Out-of-line extent tree node, holding further records when an inode's
/// inline list overflows. `h_blkno` records the block number this node was
/// supposed to be written at, for the extent-list repair rules'
/// self-consistency check.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ExtentBlock {
	pub h_signature: [u8; 4],
	pub h_blkno: u64,
	pub h_list: ExtentList,
}

pub const EXTENT_BLOCK_SIGNATURE: [u8; 4] = *b"EXBL";

impl ExtentBlock {
	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = buf;
		read_struct(&mut cursor)
	}

	pub fn write_into(&self, buf: &mut [u8]) -> io::Result<()> {
		let mut cursor = &mut *buf;
		write_struct(&mut cursor, self)
	}

	pub fn has_signature(&self) -> bool {
		self.h_signature == EXTENT_BLOCK_SIGNATURE
	}
}
