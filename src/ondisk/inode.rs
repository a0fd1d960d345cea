//! The generic inode record (`ocfs2_dinode` in the original).
//!
//! Field and flag names ground directly in `fsck.ocfs2/pass0.c`/`pass1.c`/
//! `pass1b.c`: `i_flags` with `OCFS2_VALID_FL`/`OCFS2_CHAIN_FL`/
//! `OCFS2_SUPER_BLOCK_FL`/`OCFS2_LOCAL_ALLOC_FL`/`OCFS2_DEALLOC_FL`,
//! `i_links_count`, `i_dtime`, `i_size`, `i_clusters`, `i_generation`,
//! `i_dyn_features` with `OCFS2_INLINE_DATA_FL`/`OCFS2_INLINE_XATTR_FL`.
//! Layout generalizes this workspace's `mkfs/src/ext2.rs::INode` (mode, link
//! count, size, block-pointer body) to the clustered format's chain/extent
//! union body (`ocfs2_dinode`'s `id2` union).

use super::chain::ChainList;
use super::extent::ExtentList;
use super::raw::{read_struct, write_struct};
use std::io;

pub const DINODE_SIGNATURE: [u8; 4] = *b"INDE";

pub const VALID_FL: u32 = 0x0001;
pub const SYSTEM_FILE_FL: u32 = 0x0002;
pub const SUPER_BLOCK_FL: u32 = 0x0004;
pub const LOCAL_ALLOC_FL: u32 = 0x0008;
pub const DEALLOC_FL: u32 = 0x0010;
pub const CHAIN_FL: u32 = 0x0020;
/// Set on a journal inode while its journal has uncommitted work that has
/// not yet been replayed; cleared by `journal::replay_all` after both
/// sweeps succeed.
pub const DIRTY_FL: u32 = 0x0040;

pub const INLINE_DATA_FL: u32 = 0x0001;
pub const INLINE_XATTR_FL: u32 = 0x0002;
pub const HAS_XATTR_FL: u32 = 0x0004;
pub const REFCOUNTED_FL: u32 = 0x0008;
pub const INDEXED_DIR_FL: u32 = 0x0010;

/// Unix file-mode bits this crate actually distinguishes.
pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;

/// The inode body, a union in the original (`ocfs2_dinode.id2`) between a
/// chain-allocator header, an extent tree, and (when `INLINE_DATA_FL` is
/// set) raw bytes stored directly in the inode block.
#[derive(Clone, Copy)]
pub enum InodeBody {
	Chain(ChainList),
	ExtentTree(ExtentList),
	InlineData([u8; 256]),
}

/// The generic inode record. `InodeBody` is stored out-of-line from the
/// `#[repr(C, packed)]` fixed header since it's logically a union and Rust
/// enums aren't FFI-safe unions; `read`/`write` below splice the two back
/// into one on-disk block.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DInodeHeader {
	pub i_signature: [u8; 4],
	pub i_generation: u32,
	pub i_flags: u32,
	pub i_dyn_features: u32,
	pub i_blkno: u64,
	pub i_size: u64,
	pub i_clusters: u32,
	pub i_links_count: u16,
	pub i_mode: u16,
	/// Owning user and group id, used only by Pass 5's quota usage scan.
	pub i_uid: u32,
	pub i_gid: u32,
	pub i_dtime: u64,
	/// Block number of this inode's external xattr block or bucket-tree
	/// root, valid only when `i_dyn_features & HAS_XATTR_FL` and
	/// `i_dyn_features & INLINE_XATTR_FL` is clear. Zero otherwise.
	pub i_xattr_loc: u64,
	/// Block number of this inode's refcount tree root, valid only when
	/// `i_dyn_features & REFCOUNTED_FL` is set. Zero otherwise.
	pub i_refcount_loc: u64,
}

pub struct DInode {
	pub header: DInodeHeader,
	pub body: InodeBody,
}

const BODY_OFFSET: usize = std::mem::size_of::<DInodeHeader>();
const BODY_TAG_CHAIN: u8 = 0;
const BODY_TAG_EXTENT: u8 = 1;
const BODY_TAG_INLINE: u8 = 2;

impl DInode {
	pub fn has_signature(&self) -> bool {
		self.header.i_signature == DINODE_SIGNATURE
	}

	pub fn is_valid(&self) -> bool {
		self.header.i_flags & VALID_FL != 0
	}

	pub fn is_chain_allocator(&self) -> bool {
		self.header.i_flags & CHAIN_FL != 0
	}

	pub fn is_dirty(&self) -> bool {
		self.header.i_flags & DIRTY_FL != 0
	}

	pub fn clear_dirty(&mut self) {
		self.header.i_flags &= !DIRTY_FL;
	}

	pub fn is_dir(&self) -> bool {
		self.header.i_mode & S_IFMT == S_IFDIR
	}

	pub fn is_regular(&self) -> bool {
		self.header.i_mode & S_IFMT == S_IFREG
	}

	pub fn is_symlink(&self) -> bool {
		self.header.i_mode & S_IFMT == S_IFLNK
	}

	/// System files that must never be offered for deletion by the
	/// duplicate-cluster reconciliation pass.
	pub fn is_undeletable_system_file(&self) -> bool {
		self.header.i_flags & (SUPER_BLOCK_FL | LOCAL_ALLOC_FL | DEALLOC_FL) != 0
	}

	pub fn has_inline_data(&self) -> bool {
		self.header.i_dyn_features & INLINE_DATA_FL != 0
	}

	pub fn has_xattr(&self) -> bool {
		self.header.i_dyn_features & HAS_XATTR_FL != 0
	}

	pub fn chain_list(&self) -> Option<&ChainList> {
		match &self.body {
			InodeBody::Chain(cl) => Some(cl),
			_ => None,
		}
	}

	pub fn chain_list_mut(&mut self) -> Option<&mut ChainList> {
		match &mut self.body {
			InodeBody::Chain(cl) => Some(cl),
			_ => None,
		}
	}

	pub fn extent_list(&self) -> Option<&ExtentList> {
		match &self.body {
			InodeBody::ExtentTree(el) => Some(el),
			_ => None,
		}
	}

	pub fn extent_list_mut(&mut self) -> Option<&mut ExtentList> {
		match &mut self.body {
			InodeBody::ExtentTree(el) => Some(el),
			_ => None,
		}
	}

	pub fn read(buf: &[u8]) -> io::Result<Self> {
		let mut cursor = &buf[..BODY_OFFSET];
		let header: DInodeHeader = read_struct(&mut cursor)?;
		let tag = buf[BODY_OFFSET];
		let body_bytes = &buf[BODY_OFFSET + 1..];
		let body = match tag {
			BODY_TAG_CHAIN => InodeBody::Chain(read_struct(&mut &body_bytes[..])?),
			BODY_TAG_EXTENT => InodeBody::ExtentTree(read_struct(&mut &body_bytes[..])?),
			_ => {
				let mut data = [0u8; 256];
				let n = body_bytes.len().min(256);
				data[..n].copy_from_slice(&body_bytes[..n]);
				InodeBody::InlineData(data)
			}
		};
		Ok(DInode { header, body })
	}

	pub fn write_into(&self, buf: &mut [u8]) -> io::Result<()> {
		{
			let mut cursor = &mut buf[..BODY_OFFSET];
			write_struct(&mut cursor, &self.header)?;
		}
		let (tag, body_bytes): (u8, &mut [u8]) = (
			match &self.body {
				InodeBody::Chain(_) => BODY_TAG_CHAIN,
				InodeBody::ExtentTree(_) => BODY_TAG_EXTENT,
				InodeBody::InlineData(_) => BODY_TAG_INLINE,
			},
			&mut buf[BODY_OFFSET + 1..],
		);
		buf[BODY_OFFSET] = tag;
		match &self.body {
			InodeBody::Chain(cl) => write_struct(&mut &mut body_bytes[..], cl)?,
			InodeBody::ExtentTree(el) => write_struct(&mut &mut body_bytes[..], el)?,
			InodeBody::InlineData(data) => {
				let n = data.len().min(body_bytes.len());
				body_bytes[..n].copy_from_slice(&data[..n]);
			}
		}
		Ok(())
	}
}
