//! End-of-Pass-1 refcount-tree reconciliation.
//!
//! Grounded in `original_source/fsck.ocfs2/refcount.c`'s `check_rb`/
//! `check_rl`. The original's `check_rb` recurses over a tree of refcount
//! blocks reached through an extent list (`rf_list`) when the root carries
//! `OCFS2_REFCOUNT_TREE_FL`, descending to leaf blocks that each hold a flat
//! `ocfs2_refcount_list`. This crate's `RefcountBlock` only ever models that
//! flat leaf shape directly on the root, so this module runs `check_rl`'s
//! record-level checks against the root's own `rf_records` and skips the
//! child-block recursion the original needs for its larger on-disk format.

use crate::error::CheckResult;
use crate::ondisk::refcount::{RefcountRec, RefcountRecList, MAX_REFCOUNT_RECS};
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;

/// Runs the reconciliation pass over every refcount tree root Pass 1
/// registered a claim against.
pub fn reconcile(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	let roots: Vec<u64> = state.refcount_trees.keys().copied().collect();
	for root_blkno in roots {
		reconcile_one(state, prompter, root_blkno)?;
	}
	Ok(())
}

fn reconcile_one(state: &mut CheckerState, prompter: &mut dyn Prompter, root_blkno: u64) -> CheckResult<()> {
	let mut rb = match state.fs.read_refcount_block(root_blkno) {
		Ok(rb) => rb,
		Err(_) => {
			crate::verbosef!(state, "refcount tree root {root_blkno} is unreadable; skipping reconciliation");
			return Ok(());
		}
	};

	let already_dup = state.mark_found_block(root_blkno);
	if already_dup {
		crate::verbosef!(state, "refcount block {root_blkno} claimed by more than one tree");
	}

	if rb.rf_blkno != root_blkno {
		let recorded = rb.rf_blkno;
		let message =
			format!("a refcount block at {root_blkno} claims to be located at block {recorded}; update its location");
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			rb.rf_blkno = root_blkno;
		}
	}

	let expected_gen = state.fs.super_block.s_generation;
	if rb.rf_fs_generation != expected_gen {
		let recorded = rb.rf_fs_generation;
		let message = format!(
			"refcount block {root_blkno} has generation {recorded}, which doesn't match the volume's generation {expected_gen}; fix"
		);
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			rb.rf_fs_generation = expected_gen;
		}
	}

	if rb.rf_records.rl_count > MAX_REFCOUNT_RECS as u16 || rb.rf_records.rl_used > rb.rf_records.rl_count {
		let count = rb.rf_records.rl_count;
		let used = rb.rf_records.rl_used;
		let message = format!(
			"refcount list in tree {root_blkno} (count={count}, used={used}) exceeds the {MAX_REFCOUNT_RECS}-record maximum; clamp"
		);
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			rb.rf_records.clamp(MAX_REFCOUNT_RECS as u16);
		}
	}

	check_records(state, prompter, root_blkno, &mut rb.rf_records);

	let recomputed: u32 = rb.rf_records.records().iter().map(|r| r.r_clusters).sum();
	if rb.rf_clusters != recomputed {
		let recorded = rb.rf_clusters;
		let message =
			format!("refcount tree {root_blkno} claims {recorded} clusters, but its list only accounts for {recomputed}; fix");
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			rb.rf_clusters = recomputed;
		}
	}

	check_claims(state, root_blkno, rb.rf_clusters);

	state.fs.write_refcount_block(root_blkno, &rb)?;
	Ok(())
}

/// Drops a record whose cluster range runs past the volume, and any record
/// whose `r_cpos` collides with (is less than the end of) the previous
/// surviving record, mirroring `check_rl`'s two removal conditions.
fn check_records(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	root_blkno: u64,
	list: &mut RefcountRecList,
) {
	let bpc = state.fs.blocks_per_cluster() as u64;
	let block_count = state.fs.dev.block_count();
	let cluster_count = block_count / bpc.max(1);

	let mut c_end = 0u64;
	let mut idx = 0usize;
	while idx < list.records().len() {
		let rec: RefcountRec = list.records()[idx];
		let end = rec.r_cpos + rec.r_clusters as u64;

		if rec.r_clusters == 0 || end > cluster_count {
			let message = format!(
				"refcount record {idx} in tree {root_blkno} refers to a cluster range that is out of range; remove it"
			);
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				list.remove_record(idx);
				continue;
			}
		}

		if rec.r_cpos < c_end {
			let message =
				format!("refcount record {idx} in tree {root_blkno} collides with the previous record; remove it");
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				list.remove_record(idx);
				continue;
			}
		}

		c_end = end;
		idx += 1;
	}
}

/// Cross-checks the clusters Pass 1 saw owner inodes claim against this
/// tree against the tree's own (possibly just-repaired) `rf_clusters`
/// total. A referencing inode can never legitimately claim more refcounted
/// clusters than the tree holds; when it does, which side is wrong isn't
/// determinable from this data alone, so this is reported rather than
/// repaired, the same caution the original shows for checks it can't fully
/// resolve (e.g. its own "XXX test that the block isn't already used").
fn check_claims(state: &mut CheckerState, root_blkno: u64, rf_clusters: u32) {
	let Some(tree) = state.refcount_trees.get(&root_blkno) else { return };
	for (&owner, &claimed) in &tree.claimed {
		if claimed > rf_clusters {
			state.saw_error = true;
			crate::verbosef!(
				state,
				"inode {owner} claims {claimed} clusters against refcount tree {root_blkno}, which only has {rf_clusters}"
			);
		}
	}
}
