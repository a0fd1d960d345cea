//! Pass 1d — reconciles the blocks Pass 1b found claimed by more than one
//! live owner.
//!
//! Grounded in `original_source/fsck.ocfs2/pass1b.c`'s `o2fsck_pass1d`/
//! `for_each_owner`/`count_func`/`print_func`/`print_inode_path`: for every
//! multiply-claimed block with two or more owners that haven't already been
//! handled, print the block and its owners' paths. The original's own
//! `o2fsck_pass1d` stops there — despite its file header describing clone-or-
//! delete remediation, the function it names only prints. This module
//! actually selects a policy per owner, since that selection (not merely a
//! report of the conflict) is what this checker is asked to do: the first
//! owner encountered keeps its claim untouched, and every owner after it is
//! either cleared (on "yes") or left in place with its claim marked as
//! acknowledged but unresolved (on "no"), never both. System-file owners
//! (`DInode::is_undeletable_system_file`) are never offered deletion at all.

use crate::error::CheckResult;
use crate::ondisk::inode::DInode;
use crate::pass1b::{DupInode, DuplicateContext, DUP_INODE_CLONED, DUP_INODE_REMOVED};
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;
use crate::util::get_timestamp;

/// Runs Pass 1d and then drops `ctx`, releasing every duplicate, inode, and
/// owner entry the duplicate-cluster sub-pipeline built.
pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter, mut ctx: DuplicateContext) -> CheckResult<()> {
	if ctx.dup_blocks.is_empty() {
		return Ok(());
	}
	crate::verbosef!(state, "Pass 1d: Reconciling multiply-claimed clusters");

	let blocks: Vec<u64> = ctx.dup_blocks.keys().copied().collect();
	for blkno in blocks {
		reconcile_block(state, prompter, &mut ctx, blkno)?;
	}
	Ok(())
}

fn reconcile_block(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	ctx: &mut DuplicateContext,
	blkno: u64,
) -> CheckResult<()> {
	let owners = ctx.dup_blocks.get(&blkno).cloned().unwrap_or_default();
	let live: Vec<u64> =
		owners.iter().copied().filter(|o| !ctx.dup_inodes.get(o).map(DupInode::is_handled).unwrap_or(false)).collect();
	if live.len() < 2 {
		return Ok(());
	}

	println!("Block {blkno} is claimed by the following inodes:");
	for &owner in &live {
		println!("  {}", display_path(ctx, owner));
	}

	// The first live owner keeps its claim; every one after it is offered
	// for deletion (or acknowledged as an unresolved clone) in turn.
	for &owner in &live[1..] {
		reconcile_owner(state, prompter, ctx, blkno, owner)?;
	}
	Ok(())
}

fn display_path(ctx: &DuplicateContext, owner: u64) -> String {
	match ctx.dup_inodes.get(&owner).and_then(|di| di.path.as_deref()) {
		Some(path) => path.to_string(),
		None => format!("<{owner}>"),
	}
}

fn reconcile_owner(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	ctx: &mut DuplicateContext,
	blkno: u64,
	owner: u64,
) -> CheckResult<()> {
	let mut inode = match state.fs.read_inode(owner) {
		Ok(inode) if inode.has_signature() => inode,
		_ => return Ok(()),
	};

	if inode.is_undeletable_system_file() {
		crate::verbosef!(state, "inode {owner} is a system file; leaving its claim on block {blkno} as-is");
		mark(ctx, owner, DUP_INODE_CLONED);
		return Ok(());
	}

	let path = display_path(ctx, owner);
	let message =
		format!("inode {owner} ({path}) shares block {blkno} with another inode; delete it to resolve the conflict?");
	if state.confirm(prompter, PromptDefault::Ask, &message) {
		clear_inode(&mut inode);
		state.fs.write_inode(owner, &inode)?;
		mark(ctx, owner, DUP_INODE_REMOVED);
	} else {
		crate::verbosef!(
			state,
			"inode {owner}'s claim on block {blkno} was left in place; cloning its data to a new location isn't \
			 something this checker can do without a free-space allocator"
		);
		mark(ctx, owner, DUP_INODE_CLONED);
	}
	Ok(())
}

fn clear_inode(inode: &mut DInode) {
	inode.header.i_dtime = get_timestamp().as_secs().max(1);
	inode.header.i_links_count = 0;
}

fn mark(ctx: &mut DuplicateContext, owner: u64, bit: u8) {
	if let Some(di) = ctx.dup_inodes.get_mut(&owner) {
		di.state |= bit;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::MemBlockDevice;
	use crate::ondisk::fs::Filesystem;
	use crate::ondisk::inode::{DInodeHeader, InodeBody, DINODE_SIGNATURE, S_IFREG, SUPER_BLOCK_FL, VALID_FL};
	use crate::ondisk::superblock::{SuperBlock, SUPERBLOCK_SIGNATURE};
	use crate::prompt::{Answer, ScriptedPrompter};

	fn new_state() -> CheckerState {
		let dev: Box<dyn crate::disk::BlockDevice> = Box::new(MemBlockDevice::new(512, 512));
		let sb = SuperBlock {
			s_signature: SUPERBLOCK_SIGNATURE,
			s_generation: 1,
			s_blocksize_bits: 9,
			s_clustersize_bits: 9,
			s_clusters_per_group: 8,
			s_max_slots: 1,
			_pad0: 0,
			s_feature_incompat: 0,
			s_feature_ro_compat: 0,
			s_feature_compat: 0,
			s_root_blkno: 3,
			s_system_dir_blkno: 4,
			s_first_cluster_group_blkno: 5,
			s_clusters_count: 512,
			s_blocks_count: 512,
			s_uuid: [0; 16],
			s_checksum: 0,
		};
		let fs = Filesystem { dev, super_block: sb, super_blkno: 2, system_dir_blkno: 4 };
		CheckerState::new(fs, crate::prompt::PromptDefault::Ask, false, true, false)
	}

	fn write_file(state: &mut CheckerState, blkno: u64, flags: u32) {
		let inode = DInode {
			header: DInodeHeader {
				i_signature: DINODE_SIGNATURE,
				i_generation: 1,
				i_flags: VALID_FL | flags,
				i_dyn_features: 0,
				i_blkno: blkno,
				i_size: 0,
				i_clusters: 0,
				i_links_count: 1,
				i_uid: 0,
				i_gid: 0,
				i_mode: S_IFREG,
				i_dtime: 0,
				i_xattr_loc: 0,
				i_refcount_loc: 0,
			},
			body: InodeBody::InlineData([0; 256]),
		};
		state.fs.write_inode(blkno, &inode).unwrap();
	}

	fn ctx_with(owners: &[u64], block: u64) -> DuplicateContext {
		let mut ctx = DuplicateContext::new();
		for &o in owners {
			ctx.dup_inodes.insert(o, DupInode::default());
		}
		ctx.dup_blocks.insert(block, owners.to_vec());
		ctx
	}

	#[test]
	fn single_live_owner_is_left_untouched() {
		let mut state = new_state();
		write_file(&mut state, 30, 0);
		let ctx = ctx_with(&[30], 80);
		let mut prompter = ScriptedPrompter::new([]);
		run(&mut state, &mut prompter, ctx).unwrap();

		let back = state.fs.read_inode(30).unwrap();
		assert_eq!({ back.header.i_links_count }, 1);
	}

	#[test]
	fn second_owner_is_cleared_on_yes() {
		let mut state = new_state();
		write_file(&mut state, 30, 0);
		write_file(&mut state, 31, 0);
		let ctx = ctx_with(&[30, 31], 80);

		let mut prompter = ScriptedPrompter::always_yes();
		run(&mut state, &mut prompter, ctx).unwrap();

		let first = state.fs.read_inode(30).unwrap();
		assert_eq!({ first.header.i_links_count }, 1);
		let second = state.fs.read_inode(31).unwrap();
		assert_eq!({ second.header.i_links_count }, 0);
		assert_ne!({ second.header.i_dtime }, 0);
	}

	#[test]
	fn second_owner_keeps_its_claim_on_no() {
		let mut state = new_state();
		write_file(&mut state, 30, 0);
		write_file(&mut state, 31, 0);
		let ctx = ctx_with(&[30, 31], 80);

		let mut prompter = ScriptedPrompter::new([Answer::No]);
		run(&mut state, &mut prompter, ctx).unwrap();

		let second = state.fs.read_inode(31).unwrap();
		assert_eq!({ second.header.i_links_count }, 1);
		assert!(state.uncorrected);
	}

	#[test]
	fn system_file_owner_is_never_prompted_for_deletion() {
		let mut state = new_state();
		write_file(&mut state, 30, 0);
		write_file(&mut state, 31, SUPER_BLOCK_FL);
		let ctx = ctx_with(&[30, 31], 80);

		// No scripted answers: a prompt here would panic the scripted
		// prompter, proving the system file was never asked about.
		let mut prompter = ScriptedPrompter::new([]);
		run(&mut state, &mut prompter, ctx).unwrap();

		let second = state.fs.read_inode(31).unwrap();
		assert_eq!({ second.header.i_links_count }, 1);
	}

	#[test]
	fn already_handled_owners_drop_below_the_two_owner_threshold() {
		let mut state = new_state();
		write_file(&mut state, 30, 0);
		write_file(&mut state, 31, 0);
		let mut ctx = ctx_with(&[30, 31], 80);
		ctx.dup_inodes.get_mut(&31).unwrap().state = DUP_INODE_REMOVED;

		// Only one live owner remains, so no prompt should fire.
		let mut prompter = ScriptedPrompter::new([]);
		run(&mut state, &mut prompter, ctx).unwrap();
	}
}
