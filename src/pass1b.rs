//! Pass 1b — determines which inodes own the blocks Pass 1 found claimed by
//! more than one inode.
//!
//! Grounded in `original_source/fsck.ocfs2/pass1b.c`'s `o2fsck_pass1b`/
//! `dup_insert`/`process_inode_extents`/`process_inode_chains`/
//! `process_inode_xattrs`: rescan every inode with the same iteration Pass 1
//! used, and for every block it references, test that block against the
//! duplicate map Pass 1 built. This crate's Pass 1 (see the "metadata-block
//! marking" decision in `pass1/extent.rs`) tracks duplicates for *every*
//! block an extent tree visits, metadata nodes included, not only leaf data
//! blocks the way the original's `OCFS2_EXTENT_FLAG_DATA_ONLY` walk does; this
//! pass matches that by walking the whole tree rather than leaves alone.

use crate::error::CheckResult;
use crate::ondisk::extent::ExtentList;
use crate::ondisk::inode::{InodeBody, DEALLOC_FL, INLINE_XATTR_FL, LOCAL_ALLOC_FL, SUPER_BLOCK_FL};
use crate::state::CheckerState;
use std::collections::BTreeMap;

pub const DUP_INODE_CLONED: u8 = 0x01;
pub const DUP_INODE_REMOVED: u8 = 0x02;
pub const DUP_INODE_HANDLED: u8 = DUP_INODE_CLONED | DUP_INODE_REMOVED;

/// One inode known to own at least one multiply-claimed block. Mirrors
/// `struct dup_inode`'s `di_flags`/`di_path`/`di_state`.
#[derive(Clone, Debug, Default)]
pub struct DupInode {
	pub flags: u32,
	pub path: Option<String>,
	pub state: u8,
}

impl DupInode {
	pub fn is_handled(&self) -> bool {
		self.state & DUP_INODE_HANDLED != 0
	}
}

/// Context for Passes 1b-1d, scoped to their lifetime and discarded once
/// Pass 1d finishes reconciling every duplicate. Mirrors `struct dup_context`'s
/// `dup_clusters`/`dup_inodes` red-black trees as `BTreeMap`s.
#[derive(Default)]
pub struct DuplicateContext {
	/// Multiply-claimed block to its owning inodes, insertion order, each
	/// inode appearing at most once.
	pub dup_blocks: BTreeMap<u64, Vec<u64>>,
	pub dup_inodes: BTreeMap<u64, DupInode>,
}

impl DuplicateContext {
	pub fn new() -> Self {
		Self::default()
	}

	fn insert(&mut self, block: u64, owner: u64, flags: u32) {
		self.dup_inodes.entry(owner).or_insert_with(|| DupInode { flags, path: None, state: 0 });
		let owners = self.dup_blocks.entry(block).or_default();
		if !owners.contains(&owner) {
			owners.push(owner);
		}
	}
}

/// Runs Pass 1b. Does nothing (and returns an empty context) if Pass 1 never
/// observed a duplicate.
pub fn run(state: &mut CheckerState) -> CheckResult<DuplicateContext> {
	let mut ctx = DuplicateContext::new();
	if state.dup_blocks.is_empty() {
		return Ok(ctx);
	}

	crate::verbosef!(
		state,
		"Running additional passes to resolve clusters claimed by more than one inode..."
	);
	crate::verbosef!(state, "Pass 1b: Determining ownership of multiply-claimed clusters");

	let candidates = crate::pass1::discover_candidates(state)?;
	for blkno in candidates {
		process_inode(state, &mut ctx, blkno)?;
	}
	Ok(ctx)
}

fn process_inode(state: &mut CheckerState, ctx: &mut DuplicateContext, inode_blkno: u64) -> CheckResult<()> {
	let inode = match state.fs.read_inode(inode_blkno) {
		Ok(inode) if inode.has_signature() => inode,
		_ => return Ok(()),
	};
	if !inode.is_valid() {
		return Ok(());
	}
	let flags = inode.header.i_flags;

	let skip_body =
		flags & (SUPER_BLOCK_FL | LOCAL_ALLOC_FL | DEALLOC_FL) != 0 || (inode.is_symlink() && inode.header.i_clusters == 0);

	if !skip_body {
		match &inode.body {
			InodeBody::ExtentTree(el) => {
				let el = *el;
				let depth = el.l_tree_depth;
				let hits = collect_extent_blocks(state, &el, depth)?;
				record_hits(state, ctx, inode_blkno, flags, &hits);
			}
			InodeBody::Chain(cl) => {
				let cl = *cl;
				let mut hits = Vec::new();
				state.fs.chain_iterate(&cl, |_idx, blkno, _gd| {
					hits.push(blkno);
					Ok(())
				})?;
				record_hits(state, ctx, inode_blkno, flags, &hits);
			}
			InodeBody::InlineData(_) => {}
		}
	}

	if inode.has_xattr() && inode.header.i_dyn_features & INLINE_XATTR_FL == 0 {
		let xattr_blkno = inode.header.i_xattr_loc;
		if xattr_blkno != 0 {
			record_hits(state, ctx, inode_blkno, flags, &[xattr_blkno]);
		}
	}

	Ok(())
}

/// Collects every block an extent tree visits, out-of-line metadata nodes
/// and leaf data blocks alike, matching Pass 1's own marking scope.
fn collect_extent_blocks(state: &mut CheckerState, el: &ExtentList, depth: u16) -> CheckResult<Vec<u64>> {
	let mut blocks = Vec::new();
	let bpc = state.fs.blocks_per_cluster();

	if depth == 0 {
		for rec in el.records() {
			if rec.is_empty() {
				continue;
			}
			for i in 0..(rec.e_clusters * bpc) as u64 {
				blocks.push(rec.e_blkno + i);
			}
		}
		return Ok(blocks);
	}

	for rec in el.records() {
		if rec.is_empty() {
			continue;
		}
		blocks.push(rec.e_blkno);
		match state.fs.read_extent_block(rec.e_blkno) {
			Ok(child) if child.has_signature() => {
				blocks.extend(collect_extent_blocks(state, &child.h_list, depth - 1)?);
			}
			_ => {}
		}
	}
	Ok(blocks)
}

fn record_hits(state: &mut CheckerState, ctx: &mut DuplicateContext, inode_blkno: u64, flags: u32, blocks: &[u64]) {
	for &blkno in blocks {
		if state.dup_blocks.test(blkno) {
			crate::verbosef!(state, "marking multiply-claimed block {blkno} as claimed by inode {inode_blkno}");
			ctx.insert(blkno, inode_blkno, flags);
		}
	}
}
