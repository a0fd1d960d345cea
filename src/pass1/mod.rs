//! Pass 1 — inode and extent walk.
//!
//! Grounded in `fsck.ocfs2/pass1.c`'s `o2fsck_pass1`: discover every inode by
//! walking the global and per-slot inode allocators, validate each inode's
//! own fields in place, walk whatever it references (extent tree, chain
//! list, or inline data), and fold the observations into `CheckerState` for
//! later passes. `extent` and `xattr` hold the block-reference walks;
//! everything driving one inode through the rest of the per-inode procedure
//! lives here.

pub mod extent;
pub mod xattr;

use crate::error::CheckResult;
use crate::ondisk::chain::ChainList;
use crate::ondisk::inode::{DInode, InodeBody, REFCOUNTED_FL};
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;
use crate::util::get_timestamp;

/// Runs Pass 1 over every inode reachable from the global inode allocator
/// and each slot's local inode allocator.
pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	let candidates = discover_candidates(state)?;
	for blkno in candidates {
		check_one_inode(state, prompter, blkno)?;
	}
	Ok(())
}

/// Builds the list of blocks worth attempting `read_inode` on: every block
/// in `[bg_blkno+1, bg_blkno+bg_bits_count]` for every group descriptor
/// reachable from the global and per-slot inode allocators. See the "Pass 1
/// inode discovery" note for why this crate scans candidate ranges rather
/// than a real per-bit allocation bitmap.
pub(crate) fn discover_candidates(state: &mut CheckerState) -> CheckResult<Vec<u64>> {
	let mut candidates = Vec::new();

	let global_blkno = state.fs.lookup_system_inode("inode_alloc", None)?;
	collect_from_allocator(state, global_blkno, &mut candidates)?;

	let max_slots = state.fs.super_block.s_max_slots;
	for slot in 0..max_slots {
		let blkno = state.fs.lookup_system_inode("inode_alloc", Some(slot))?;
		collect_from_allocator(state, blkno, &mut candidates)?;
	}

	Ok(candidates)
}

fn collect_from_allocator(state: &mut CheckerState, alloc_blkno: u64, out: &mut Vec<u64>) -> CheckResult<()> {
	let alloc_inode = state.fs.read_inode(alloc_blkno)?;
	let cl: ChainList = match alloc_inode.chain_list() {
		Some(cl) => *cl,
		None => return Err(crate::error::CheckError::internal(format!("inode {alloc_blkno} is not a chain allocator"))),
	};
	state.fs.chain_iterate(&cl, |_chain_idx, _blkno, gd| {
		let start = gd.bg_blkno + 1;
		for i in 0..gd.bg_bits_count as u64 {
			out.push(start + i);
		}
		Ok(())
	})?;
	Ok(())
}

/// Runs the per-inode procedure on one candidate block. A candidate whose
/// signature is missing or whose VALID flag is clear is a free slot, not a
/// problem, and is skipped silently.
fn check_one_inode(state: &mut CheckerState, prompter: &mut dyn Prompter, inode_blkno: u64) -> CheckResult<()> {
	let mut inode = match state.fs.read_inode(inode_blkno) {
		Ok(inode) if inode.has_signature() => inode,
		_ => return Ok(()),
	};
	if !inode.is_valid() {
		return Ok(());
	}

	verify_in_place(state, prompter, inode_blkno, &mut inode)?;
	record_type_and_usage(state, inode_blkno, &inode);

	let totals = walk_body(state, prompter, inode_blkno, &mut inode)?;
	reconcile_size(state, prompter, inode_blkno, &mut inode)?;

	if inode.has_xattr() {
		xattr::check_xattr(state, prompter, inode_blkno, &mut inode)?;
	}

	if inode.header.i_dyn_features & REFCOUNTED_FL != 0 && state.fs.super_block.has_refcount_feature() {
		let root = inode.header.i_refcount_loc;
		state.refcount_trees.entry(root).or_default().claimed.insert(inode_blkno, totals.clusters_claimed);
	}

	update_stats(state, &inode);
	state.fs.write_inode(inode_blkno, &inode)?;
	Ok(())
}

/// Step 2 of the per-inode procedure: link-count bookkeeping, the
/// root-inode sanity check, and dtime bookkeeping.
fn verify_in_place(state: &mut CheckerState, prompter: &mut dyn Prompter, inode_blkno: u64, inode: &mut DInode) -> CheckResult<()> {
	if inode.header.i_links_count != 0 {
		state.icount_in_inodes.set(inode_blkno, inode.header.i_links_count);
	}

	if inode_blkno == state.fs.super_block.s_root_blkno && !inode.is_dir() {
		let message = format!("inode {inode_blkno} is the root inode but is not a directory; clear it so it can be re-created");
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			inode.header.i_dtime = get_timestamp().as_secs().max(1);
			inode.header.i_links_count = 0;
		} else {
			state.bad.set(inode_blkno);
		}
	}

	if inode.header.i_links_count != 0 && inode.header.i_dtime != 0 {
		let dtime = inode.header.i_dtime;
		let message = format!("inode {inode_blkno} has {} links but a non-zero dtime ({dtime}); clear dtime", { inode.header.i_links_count });
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			inode.header.i_dtime = 0;
		}
	}
	Ok(())
}

/// Step 3: type-bitmap and `used` registration. A second claim on `used` is
/// logged but otherwise left alone — Pass 1 has no mechanism to undo a scan
/// that already happened for the first claimant.
fn record_type_and_usage(state: &mut CheckerState, inode_blkno: u64, inode: &DInode) {
	if inode.is_dir() {
		state.dir.set(inode_blkno);
	}
	if inode.is_regular() {
		state.regular.set(inode_blkno);
	}
	if state.used.set(inode_blkno) {
		state.saw_error = true;
		crate::verbosef!(state, "inode {inode_blkno} scanned more than once while walking the allocators");
	}
}

/// Step 4: walks whatever the inode's body references, dispatching on the
/// body's kind. Returns the leaf-cluster total accumulated (zero for bodies
/// with no extent tree), used by step 5's size reconciliation and step 7's
/// refcount registration.
fn walk_body(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode_blkno: u64,
	inode: &mut DInode,
) -> CheckResult<extent::ExtentWalkTotals> {
	match &inode.body {
		InodeBody::ExtentTree(_) => {
			let totals = extent::check_extents(state, prompter, inode_blkno, inode)?;
			let depth = inode.extent_list().map(|el| el.l_tree_depth).unwrap_or(0);
			state.stats.record_tree_depth(depth);
			if inode.is_dir() {
				register_dir_blocks(state, inode_blkno, inode)?;
			}
			Ok(totals)
		}
		InodeBody::Chain(_) => {
			walk_chain_body(state, inode_blkno, inode)?;
			Ok(extent::ExtentWalkTotals::default())
		}
		InodeBody::InlineData(_) => {
			if inode.is_dir() {
				// Inline directory content lives inside the inode block itself;
				// register that block as the directory's sole logical block.
				state
					.dirblocks
					.insert(inode_blkno, crate::state::DirBlockEntry { ino: inode_blkno, blkcount: 0 });
			}
			Ok(extent::ExtentWalkTotals::default())
		}
	}
}

/// Registers every logical directory block an extent-tree-bodied directory
/// covers into `CheckerState::dirblocks`, consumed by Pass 2.
fn register_dir_blocks(state: &mut CheckerState, inode_blkno: u64, inode: &DInode) -> CheckResult<()> {
	let el = match inode.extent_list() {
		Some(el) => *el,
		None => return Ok(()),
	};
	let depth = el.l_tree_depth;
	let mut blkcount = 0u64;
	state.fs.dir_iterate(&el, depth, |blkno, _buf| {
		state.dirblocks.insert(blkno, crate::state::DirBlockEntry { ino: inode_blkno, blkcount });
		blkcount += 1;
		Ok(())
	})?;
	Ok(())
}

/// Marks every group-descriptor block a chain-allocator-bodied inode's
/// chains visit as found, the chain-body counterpart to the extent walk's
/// block marking. Pass 0 already verified these chains' fields; Pass 1 only
/// needs the duplicate-block bookkeeping here.
fn walk_chain_body(state: &mut CheckerState, _inode_blkno: u64, inode: &DInode) -> CheckResult<()> {
	let cl: ChainList = match inode.chain_list() {
		Some(cl) => *cl,
		None => return Ok(()),
	};
	let mut blocks = Vec::new();
	state.fs.chain_iterate(&cl, |_chain_idx, blkno, _gd| {
		blocks.push(blkno);
		Ok(())
	})?;
	for blkno in blocks {
		let already = state.mark_found_block(blkno);
		if already {
			crate::verbosef!(state, "group descriptor block {blkno} claimed by more than one allocator");
		}
	}
	Ok(())
}

/// Step 5: cross-checks `i_size`/`i_clusters` against what the extent walk
/// actually observed, and offers to clear a zero-length directory. Only
/// meaningful for extent-tree bodies; chain and inline bodies have nothing
/// the walk could disagree with.
fn reconcile_size(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode_blkno: u64,
	inode: &mut DInode,
) -> CheckResult<()> {
	let el = match inode.extent_list() {
		Some(el) => *el,
		None => return Ok(()),
	};

	let last_logical = el.records().iter().map(|r| r.e_cpos + r.e_clusters).max().unwrap_or(0);
	let bpc = state.fs.blocks_per_cluster();
	let block_size = state.fs.block_size() as u64;
	let expected_clusters = last_logical;
	let expected_size = last_logical as u64 * bpc as u64 * block_size;

	if inode.is_dir() && expected_clusters == 0 {
		let message = format!("directory inode {inode_blkno} has no extents; clear it");
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			inode.header.i_dtime = get_timestamp().as_secs().max(1);
			inode.header.i_links_count = 0;
		}
		return Ok(());
	}

	if inode.header.i_clusters != expected_clusters {
		let recorded = inode.header.i_clusters;
		let message =
			format!("inode {inode_blkno} records i_clusters={recorded} but its extents cover {expected_clusters}; fix");
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			inode.header.i_clusters = expected_clusters;
		}
	}

	if inode.header.i_size != expected_size {
		let recorded = inode.header.i_size;
		let message = format!("inode {inode_blkno} records i_size={recorded} but its extents imply {expected_size}; fix");
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			inode.header.i_size = expected_size;
		}
	}

	Ok(())
}

fn update_stats(state: &mut CheckerState, inode: &DInode) {
	if inode.is_dir() {
		state.stats.dir_count += 1;
	} else if inode.is_symlink() {
		state.stats.symlink_count += 1;
	} else if inode.is_regular() {
		state.stats.file_count += 1;
	}
	if inode.header.i_links_count == 0 {
		state.stats.orphan_count += 1;
	}
	state.stats.links_count += inode.header.i_links_count as u64;

	if inode.header.i_links_count != 0 {
		let clusters = inode.header.i_clusters as u64;
		let user = state.user_usage.entry(inode.header.i_uid).or_insert((0, 0));
		user.0 += 1;
		user.1 += clusters;
		let group = state.group_usage.entry(inode.header.i_gid).or_insert((0, 0));
		group.0 += 1;
		group.1 += clusters;
	}
}
