//! The filesystem superblock.
//!
//! Field layout generalizes this workspace's `mkfs/src/ext2.rs::Superblock`
//! (signature/block-size-log/feature-flags shape) to the clustered,
//! cluster-granular, multi-slot filesystem this crate checks, cross-checked
//! against `fsck.ocfs2/include/fsck.h`'s use of `fs_super`/`OCFS2_*` feature
//! bits and `ocfs2/libocfs2/include/filesys.h`'s `_ocfs2_filesys` handle.

use super::raw::{read_struct, write_struct};
use crate::disk::BlockDevice;
use std::io;

/// On-disk signature stored in `s_signature`, null-padded to 8 bytes.
pub const SUPERBLOCK_SIGNATURE: [u8; 8] = *b"CLUSTFS\0";

pub const FEATURE_INCOMPAT_LOCAL_MOUNT: u32 = 0x0001;
pub const FEATURE_INCOMPAT_SPARSE_ALLOC: u32 = 0x0002;
pub const FEATURE_INCOMPAT_EXTENDED_SLOT_MAP: u32 = 0x0004;
pub const FEATURE_RO_COMPAT_USER_QUOTA: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_GROUP_QUOTA: u32 = 0x0002;
pub const FEATURE_INCOMPAT_REFCOUNT_TREE: u32 = 0x0008;

/// Mirrors the on-disk superblock record. The signature, block-count, and
/// cluster geometry fields are read by every pass; most others exist only
/// so this crate can round-trip the whole block unchanged.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SuperBlock {
	pub s_signature: [u8; 8],
	pub s_generation: u32,
	pub s_blocksize_bits: u32,
	pub s_clustersize_bits: u32,
	pub s_clusters_per_group: u32,
	pub s_max_slots: u16,
	pub _pad0: u16,
	pub s_feature_incompat: u32,
	pub s_feature_ro_compat: u32,
	pub s_feature_compat: u32,
	pub s_root_blkno: u64,
	pub s_system_dir_blkno: u64,
	pub s_first_cluster_group_blkno: u64,
	pub s_clusters_count: u32,
	pub s_blocks_count: u64,
	pub s_uuid: [u8; 16],
	pub s_checksum: u32,
}

impl SuperBlock {
	pub fn block_size(&self) -> u32 {
		1u32 << { self.s_blocksize_bits }
	}

	pub fn cluster_size(&self) -> u32 {
		1u32 << { self.s_clustersize_bits }
	}

	pub fn blocks_per_cluster(&self) -> u32 {
		self.cluster_size() / self.block_size()
	}

	pub fn has_signature(&self) -> bool {
		self.s_signature == SUPERBLOCK_SIGNATURE
	}

	pub fn has_refcount_feature(&self) -> bool {
		self.s_feature_incompat & FEATURE_INCOMPAT_REFCOUNT_TREE != 0
	}

	pub fn has_quota_feature(&self) -> bool {
		self.s_feature_ro_compat & (FEATURE_RO_COMPAT_USER_QUOTA | FEATURE_RO_COMPAT_GROUP_QUOTA) != 0
	}

	pub fn read(dev: &mut dyn BlockDevice, blkno: u64) -> io::Result<Self> {
		let bs = dev.block_size() as usize;
		let mut buf = vec![0u8; bs];
		dev.read_block(blkno, &mut buf)?;
		let mut cursor = &buf[..];
		read_struct(&mut cursor)
	}

	pub fn write(&self, dev: &mut dyn BlockDevice, blkno: u64) -> io::Result<()> {
		let bs = dev.block_size() as usize;
		let mut buf = vec![0u8; bs];
		write_struct(&mut &mut buf[..], self)?;
		dev.write_block(blkno, &buf)
	}
}

/// Candidate block numbers carrying backup copies of the superblock, for
/// use when the primary's signature or checksum is bad. Mirrors the fixed
/// power-of-two cluster-group offsets `mkfs.ocfs2` lays backups at (1, 4, 16,
/// 64, 256 cluster groups in): this locates a pre-existing backup copy
/// rather than reconstructing one from scratch.
pub fn backup_locations(clusters_per_group: u32, blocks_per_cluster: u32) -> [u64; 5] {
	const BACKUP_GROUPS: [u64; 5] = [1, 4, 16, 64, 256];
	let mut out = [0u64; 5];
	for (i, &group) in BACKUP_GROUPS.iter().enumerate() {
		out[i] = group * clusters_per_group as u64 * blocks_per_cluster as u64;
	}
	out
}
