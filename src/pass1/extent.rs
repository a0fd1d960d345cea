//! Extent-list repair walk, shared by every inode Pass 1 checks.
//!
//! Grounded in `fsck.ocfs2/pass1.c`'s `o2fsck_check_extents`/`check_el`:
//! walk an inode's extent tree depth-first, clamp a list whose `l_count`/
//! `l_next_free_rec` exceed their on-disk maximum, drop a record whose
//! `e_clusters` is zero or whose `e_blkno` lands outside the volume, and mark
//! every block the tree legitimately visits (both leaf data blocks and
//! out-of-line extent-block metadata, at every depth) in `found_blocks`, and
//! every leaf extent's physical clusters in `allocated_clusters`, so
//! Pass 1b's duplicate-cluster detection sees the whole picture. Repairs to
//! an out-of-line node are written back to its own block; repairs to the
//! root list are written back by the caller along with the rest of the
//! inode.

use crate::error::CheckResult;
use crate::ondisk::extent::{ExtentList, ExtentRec, MAX_INLINE_EXTENT_RECS};
use crate::ondisk::inode::DInode;
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;

/// Totals accumulated while walking one inode's extent tree.
#[derive(Default)]
pub struct ExtentWalkTotals {
	pub clusters_claimed: u32,
}

/// Walks and repairs `inode`'s extent tree in place, marking every block it
/// visits as found (and, on a second claim, duplicate) in `state`. Returns
/// the observed cluster total so the caller can cross-check `i_clusters`.
pub fn check_extents(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode_blkno: u64,
	inode: &mut DInode,
) -> CheckResult<ExtentWalkTotals> {
	let depth = match inode.extent_list() {
		Some(el) => el.l_tree_depth,
		None => return Ok(ExtentWalkTotals::default()),
	};

	let mut totals = ExtentWalkTotals::default();
	let el = inode.extent_list_mut().expect("checked above");
	repair_level(state, prompter, inode_blkno, depth, el, &mut totals)?;
	Ok(totals)
}

fn clamp_list(state: &mut CheckerState, prompter: &mut dyn Prompter, inode_blkno: u64, el: &mut ExtentList) -> CheckResult<()> {
	if el.l_count as usize > MAX_INLINE_EXTENT_RECS || el.l_next_free_rec > el.l_count {
		let count = el.l_count;
		let next_free = el.l_next_free_rec;
		let message = format!(
			"inode {inode_blkno}'s extent list (count={count}, next_free={next_free}) exceeds its maximum; clamp"
		);
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			el.clamp(MAX_INLINE_EXTENT_RECS as u16);
		}
	}
	Ok(())
}

/// Repairs one level of the tree in place and recurses into any non-leaf
/// record's child extent block, writing that child back if it was repaired.
/// Clamping is applied at this level too, not only at the root, since an
/// out-of-line node's own `h_list` can be corrupt independently of its parent.
fn repair_level(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode_blkno: u64,
	depth: u16,
	el: &mut ExtentList,
	totals: &mut ExtentWalkTotals,
) -> CheckResult<()> {
	clamp_list(state, prompter, inode_blkno, el)?;

	let block_count = state.fs.dev.block_count();
	let bpc = state.fs.blocks_per_cluster().max(1);
	let mut idx = 0usize;

	while idx < el.records().len() {
		let mut rec: ExtentRec = el.records()[idx];
		if rec.is_empty() {
			idx += 1;
			continue;
		}

		if rec.e_clusters == 0 || rec.e_blkno >= block_count {
			let message = format!(
				"inode {inode_blkno}'s extent record {idx} (cpos={}, clusters={}, blkno={}) is out of range; drop it",
				{ rec.e_cpos }, { rec.e_clusters }, { rec.e_blkno }
			);
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				el.remove_record(idx);
				continue;
			}
			idx += 1;
			continue;
		}

		if rec.e_blkno % bpc as u64 != 0 {
			let aligned = rec.e_blkno - (rec.e_blkno % bpc as u64);
			let message = format!(
				"inode {inode_blkno}'s extent record {idx} starts at block {} which isn't cluster-aligned; round down to {aligned}",
				{ rec.e_blkno }
			);
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				rec.e_blkno = aligned;
				el.records_mut()[idx] = rec;
			}
		}

		if rec.e_blkno + (rec.e_clusters as u64 * bpc as u64) > block_count {
			let max_clusters = ((block_count - rec.e_blkno) / bpc as u64) as u32;
			let message = format!(
				"inode {inode_blkno}'s extent record {idx} (blkno={}, clusters={}) runs past the volume; truncate to {max_clusters} clusters",
				{ rec.e_blkno }, { rec.e_clusters }
			);
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				rec.e_clusters = max_clusters;
				el.records_mut()[idx] = rec;
				if rec.e_clusters == 0 {
					el.remove_record(idx);
					continue;
				}
			}
		}

		if depth == 0 {
			mark_data_blocks(state, &rec);
			totals.clusters_claimed += rec.e_clusters;
			idx += 1;
			continue;
		}

		let already_dup = state.mark_found_block(rec.e_blkno);
		if already_dup {
			crate::verbosef!(state, "metadata block {} claimed by more than one inode", { rec.e_blkno });
		}

		match state.fs.read_extent_block(rec.e_blkno) {
			Ok(mut child) if child.has_signature() => {
				if { child.h_blkno } != rec.e_blkno {
					let recorded = child.h_blkno;
					let message = format!(
						"extent-tree node read from block {} records h_blkno={recorded}; fix",
						{ rec.e_blkno }
					);
					if state.confirm(prompter, PromptDefault::Ask, &message) {
						child.h_blkno = rec.e_blkno;
					}
				}
				repair_level(state, prompter, inode_blkno, depth - 1, &mut child.h_list, totals)?;
				state.fs.write_extent_block(rec.e_blkno, &child)?;
				idx += 1;
			}
			_ => {
				let message = format!(
					"inode {inode_blkno}'s extent-tree node at block {} (depth {depth}) has a missing or bad signature; drop this subtree",
					{ rec.e_blkno }
				);
				if state.confirm(prompter, PromptDefault::Yes, &message) {
					el.remove_record(idx);
				} else {
					idx += 1;
				}
			}
		}
	}
	Ok(())
}

fn mark_data_blocks(state: &mut CheckerState, rec: &ExtentRec) {
	let bpc = state.fs.blocks_per_cluster();
	let first_cluster = rec.e_blkno / bpc as u64;
	for c in 0..rec.e_clusters as u64 {
		state.mark_allocated_cluster(first_cluster + c);
	}
	for i in 0..(rec.e_clusters * bpc) as u64 {
		let blkno = rec.e_blkno + i;
		let already = state.mark_found_block(blkno);
		if already {
			crate::verbosef!(state, "block {blkno} claimed by more than one inode");
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::MemBlockDevice;
	use crate::ondisk::fs::Filesystem;
	use crate::ondisk::inode::{DInodeHeader, InodeBody, DINODE_SIGNATURE, VALID_FL};
	use crate::ondisk::superblock::{SuperBlock, SUPERBLOCK_SIGNATURE};
	use crate::prompt::ScriptedPrompter;

	fn empty_list() -> ExtentList {
		ExtentList {
			l_count: 32,
			l_next_free_rec: 0,
			l_tree_depth: 0,
			_pad0: 0,
			recs: [ExtentRec { e_cpos: 0, e_clusters: 0, e_leaf_clusters: 0, e_blkno: 0 }; MAX_INLINE_EXTENT_RECS],
		}
	}

	fn new_state() -> CheckerState {
		let dev: Box<dyn crate::disk::BlockDevice> = Box::new(MemBlockDevice::new(256, 256));
		let sb = SuperBlock {
			s_signature: SUPERBLOCK_SIGNATURE,
			s_generation: 1,
			s_blocksize_bits: 8,
			s_clustersize_bits: 8,
			s_clusters_per_group: 8,
			s_max_slots: 1,
			_pad0: 0,
			s_feature_incompat: 0,
			s_feature_ro_compat: 0,
			s_feature_compat: 0,
			s_root_blkno: 3,
			s_system_dir_blkno: 4,
			s_first_cluster_group_blkno: 5,
			s_clusters_count: 256,
			s_blocks_count: 256,
			s_uuid: [0; 16],
			s_checksum: 0,
		};
		let fs = Filesystem { dev, super_block: sb, super_blkno: 2, system_dir_blkno: 4 };
		CheckerState::new(fs, crate::prompt::PromptDefault::Ask, false, true, false)
	}

	fn new_state_bpc4() -> CheckerState {
		let dev: Box<dyn crate::disk::BlockDevice> = Box::new(MemBlockDevice::new(256, 256));
		let sb = SuperBlock {
			s_signature: SUPERBLOCK_SIGNATURE,
			s_generation: 1,
			s_blocksize_bits: 8,
			s_clustersize_bits: 10,
			s_clusters_per_group: 8,
			s_max_slots: 1,
			_pad0: 0,
			s_feature_incompat: 0,
			s_feature_ro_compat: 0,
			s_feature_compat: 0,
			s_root_blkno: 3,
			s_system_dir_blkno: 4,
			s_first_cluster_group_blkno: 5,
			s_clusters_count: 64,
			s_blocks_count: 256,
			s_uuid: [0; 16],
			s_checksum: 0,
		};
		let fs = Filesystem { dev, super_block: sb, super_blkno: 2, system_dir_blkno: 4 };
		CheckerState::new(fs, crate::prompt::PromptDefault::Ask, false, true, false)
	}

	fn sample_inode(el: ExtentList) -> DInode {
		DInode {
			header: DInodeHeader {
				i_signature: DINODE_SIGNATURE,
				i_generation: 1,
				i_flags: VALID_FL,
				i_dyn_features: 0,
				i_blkno: 20,
				i_size: 512,
				i_clusters: 2,
				i_links_count: 1,
				i_uid: 0,
				i_gid: 0,
				i_mode: 0,
				i_dtime: 0,
				i_xattr_loc: 0,
				i_refcount_loc: 0,
			},
			body: InodeBody::ExtentTree(el),
		}
	}

	#[test]
	fn marks_leaf_blocks_and_reports_cluster_total() {
		let mut state = new_state();
		let mut el = empty_list();
		el.l_next_free_rec = 1;
		el.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 2, e_leaf_clusters: 2, e_blkno: 50 };
		let mut inode = sample_inode(el);
		let mut prompter = ScriptedPrompter::new(Vec::<crate::prompt::Answer>::new());

		let totals = check_extents(&mut state, &mut prompter, 20, &mut inode).unwrap();
		assert_eq!(totals.clusters_claimed, 2);
		assert!(state.found_blocks.test(50));
		assert!(state.found_blocks.test(51));
	}

	#[test]
	fn out_of_range_record_is_dropped_on_yes() {
		let mut state = new_state();
		let mut el = empty_list();
		el.l_next_free_rec = 1;
		el.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 1, e_leaf_clusters: 1, e_blkno: 9_999_999 };
		let mut inode = sample_inode(el);
		let mut prompter = ScriptedPrompter::always_yes();

		let totals = check_extents(&mut state, &mut prompter, 20, &mut inode).unwrap();
		assert_eq!(totals.clusters_claimed, 0);
		let el = inode.extent_list().unwrap();
		assert_eq!({ el.l_next_free_rec }, 0);
	}

	#[test]
	fn second_inode_sharing_a_block_marks_it_duplicate() {
		let mut state = new_state();
		let mut el_a = empty_list();
		el_a.l_next_free_rec = 1;
		el_a.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 1, e_leaf_clusters: 1, e_blkno: 80 };
		let mut inode_a = sample_inode(el_a);
		let mut prompter = ScriptedPrompter::new(Vec::<crate::prompt::Answer>::new());
		check_extents(&mut state, &mut prompter, 20, &mut inode_a).unwrap();

		let mut el_b = empty_list();
		el_b.l_next_free_rec = 1;
		el_b.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 1, e_leaf_clusters: 1, e_blkno: 80 };
		let mut inode_b = sample_inode(el_b);
		check_extents(&mut state, &mut prompter, 21, &mut inode_b).unwrap();

		assert!(state.dup_blocks.test(80));
	}

	#[test]
	fn misaligned_start_is_rounded_down_on_yes() {
		let mut state = new_state_bpc4();
		let mut el = empty_list();
		el.l_next_free_rec = 1;
		el.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 1, e_leaf_clusters: 1, e_blkno: 81 };
		let mut inode = sample_inode(el);
		let mut prompter = ScriptedPrompter::always_yes();

		check_extents(&mut state, &mut prompter, 20, &mut inode).unwrap();
		assert!(state.found_blocks.test(80));
		assert!(!state.found_blocks.test(81));
	}

	#[test]
	fn extent_past_the_volume_is_truncated_on_yes() {
		let mut state = new_state_bpc4();
		let mut el = empty_list();
		el.l_next_free_rec = 1;
		el.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 10, e_leaf_clusters: 10, e_blkno: 252 };
		let mut inode = sample_inode(el);
		let mut prompter = ScriptedPrompter::always_yes();

		let totals = check_extents(&mut state, &mut prompter, 20, &mut inode).unwrap();
		assert_eq!(totals.clusters_claimed, 1);
		assert!(state.found_blocks.test(255));
	}
}
