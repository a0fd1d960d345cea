//! Pass 4 — link count reconciliation: makes every used inode's on-disk
//! `i_links_count` agree with the number of dirents Pass 2 actually found
//! naming it.
//!
//! Grounded in `original_source/fsck.ocfs2/pass4.c`'s `o2fsck_pass4`.

use crate::error::CheckResult;
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;

pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	crate::verbosef!(state, "Pass 4: Checking inodes link counts");

	let inodes: Vec<u64> = state.used.iter_set().collect();
	for ino in inodes {
		check_inode(state, prompter, ino)?;
	}
	Ok(())
}

fn check_inode(state: &mut CheckerState, prompter: &mut dyn Prompter, ino: u64) -> CheckResult<()> {
	let mut refs = state.icount_refs.get(ino);
	let in_inode = state.icount_in_inodes.get(ino);

	if refs == 0 {
		let message = format!("inode {ino} isn't referenced by any directory entries. Move it to lost+found?");
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			crate::pass3::reconnect_file(state, ino)?;
			refs = state.icount_refs.get(ino);
		}
	}

	if refs == in_inode {
		return Ok(());
	}

	let message = format!(
		"inode {ino} has a link count of {in_inode} on disk but directory entries reference it {refs} time(s). Update the count on disk to match?"
	);
	if state.confirm(prompter, PromptDefault::Yes, &message) {
		let mut inode = state.fs.read_inode(ino)?;
		inode.header.i_links_count = refs;
		state.fs.write_inode(ino, &inode)?;
		state.icount_in_inodes.set(ino, refs);
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::MemBlockDevice;
	use crate::ondisk::dirent::{DirEntry, FILE_TYPE_DIR};
	use crate::ondisk::extent::{ExtentList, ExtentRec, MAX_INLINE_EXTENT_RECS};
	use crate::ondisk::fs::Filesystem;
	use crate::ondisk::inode::{DInode, DInodeHeader, InodeBody, DINODE_SIGNATURE, S_IFDIR, S_IFREG, VALID_FL};
	use crate::ondisk::superblock::{SuperBlock, SUPERBLOCK_SIGNATURE};
	use crate::prompt::{Answer, ScriptedPrompter};
	use crate::state::DirParent;

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

	fn empty_list() -> ExtentList {
		ExtentList {
			l_count: 32,
			l_next_free_rec: 0,
			l_tree_depth: 0,
			_pad0: 0,
			recs: [ExtentRec { e_cpos: 0, e_clusters: 0, e_leaf_clusters: 0, e_blkno: 0 }; MAX_INLINE_EXTENT_RECS],
		}
	}

	fn write_file(state: &mut CheckerState, blkno: u64, links: u16) {
		let inode = DInode {
			header: DInodeHeader {
				i_signature: DINODE_SIGNATURE,
				i_generation: 1,
				i_flags: VALID_FL,
				i_dyn_features: 0,
				i_blkno: blkno,
				i_size: 0,
				i_clusters: 0,
				i_links_count: links,
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
		state.used.set(blkno);
	}

	fn write_dir(state: &mut CheckerState, blkno: u64, data_blkno: u64, links: u16) {
		let mut el = empty_list();
		el.l_next_free_rec = 1;
		el.recs[0] = ExtentRec { e_cpos: 0, e_clusters: 1, e_leaf_clusters: 1, e_blkno: data_blkno };
		let inode = DInode {
			header: DInodeHeader {
				i_signature: DINODE_SIGNATURE,
				i_generation: 1,
				i_flags: VALID_FL,
				i_dyn_features: 0,
				i_blkno: blkno,
				i_size: 512,
				i_clusters: 1,
				i_links_count: links,
				i_uid: 0,
				i_gid: 0,
				i_mode: S_IFDIR,
				i_dtime: 0,
				i_xattr_loc: 0,
				i_refcount_loc: 0,
			},
			body: InodeBody::ExtentTree(el),
		};
		state.fs.write_inode(blkno, &inode).unwrap();
		state.used.set(blkno);
		state.dir.set(blkno);
	}

	fn write_block(state: &mut CheckerState, blkno: u64, entries: &[DirEntry]) {
		let bs = state.fs.block_size() as usize;
		let mut buf = vec![0u8; bs];
		let mut offset = 0usize;
		for e in entries {
			e.encode_into(&mut buf[offset..offset + e.rec_len as usize]);
			offset += e.rec_len as usize;
		}
		if offset < bs {
			let filler =
				DirEntry { inode: 0, rec_len: (bs - offset) as u16, name_len: 0, file_type: 0, name: Vec::new() };
			filler.encode_into(&mut buf[offset..bs]);
		}
		state.fs.write_dir_block(blkno, &buf).unwrap();
	}

	#[test]
	fn matching_counts_are_left_alone() {
		let mut state = new_state();
		write_file(&mut state, 50, 1);
		state.icount_refs.set(50, 1);
		state.icount_in_inodes.set(50, 1);

		let mut prompter = ScriptedPrompter::new([]);
		run(&mut state, &mut prompter).unwrap();

		let inode = state.fs.read_inode(50).unwrap();
		assert_eq!({ inode.header.i_links_count }, 1);
		assert!(!state.saw_error);
	}

	#[test]
	fn mismatched_count_is_updated_on_yes() {
		let mut state = new_state();
		write_file(&mut state, 50, 3);
		state.icount_refs.set(50, 1);
		state.icount_in_inodes.set(50, 3);

		let mut prompter = ScriptedPrompter::always_yes();
		run(&mut state, &mut prompter).unwrap();

		let inode = state.fs.read_inode(50).unwrap();
		assert_eq!({ inode.header.i_links_count }, 1);
		assert_eq!(state.icount_in_inodes.get(50), 1);
	}

	#[test]
	fn mismatched_count_is_left_on_no() {
		let mut state = new_state();
		write_file(&mut state, 50, 3);
		state.icount_refs.set(50, 1);
		state.icount_in_inodes.set(50, 3);

		let mut prompter = ScriptedPrompter::new([Answer::No]);
		run(&mut state, &mut prompter).unwrap();

		let inode = state.fs.read_inode(50).unwrap();
		assert_eq!({ inode.header.i_links_count }, 3);
		assert!(state.uncorrected);
	}

	#[test]
	fn zero_refs_are_offered_reconnection_and_then_rechecked() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200, 2);
		write_dir(&mut state, 4, 201, 2);
		write_block(
			&mut state,
			200,
			&[DirEntry {
				inode: 9,
				rec_len: DirEntry::rec_len_for_name(10),
				name_len: 10,
				file_type: FILE_TYPE_DIR,
				name: b"lost+found".to_vec(),
			}],
		);
		write_dir(&mut state, 9, 202, 2);
		write_block(&mut state, 202, &[]);
		write_block(&mut state, 201, &[]);

		state.dir_parents.insert(3, DirParent::new(3));
		state.dir_parents.insert(4, DirParent::new(4));
		state.dir_parents.insert(9, DirParent::new(3));
		state.icount_refs.set(3, 1);
		state.icount_in_inodes.set(3, 2);
		state.icount_refs.set(4, 1);
		state.icount_in_inodes.set(4, 2);
		state.icount_refs.set(9, 1);
		state.icount_in_inodes.set(9, 2);

		write_file(&mut state, 50, 1);
		state.icount_in_inodes.set(50, 1);
		// icount_refs for 50 is left at 0: nothing names it.

		let mut prompter = ScriptedPrompter::always_yes();
		run(&mut state, &mut prompter).unwrap();

		assert_eq!(state.icount_refs.get(50), 1);
		let inode = state.fs.read_inode(50).unwrap();
		assert_eq!({ inode.header.i_links_count }, 1);

		let lost_and_found_inode = state.fs.read_inode(9).unwrap();
		let lost_and_found = state.fs.read_dirents(&lost_and_found_inode).unwrap();
		assert!(lost_and_found.iter().any(|e| e.inode == 50 && e.name == b"50"));
	}

	#[test]
	fn declining_reconnection_leaves_refs_at_zero_and_flags_uncorrected() {
		let mut state = new_state();
		write_file(&mut state, 50, 1);
		state.icount_in_inodes.set(50, 1);

		// Declining reconnection still leaves the on-disk/recorded counts out
		// of sync, so a second prompt offers to fix the link count itself.
		let mut prompter = ScriptedPrompter::new([Answer::No, Answer::No]);
		run(&mut state, &mut prompter).unwrap();

		assert_eq!(state.icount_refs.get(50), 0);
		let inode = state.fs.read_inode(50).unwrap();
		assert_eq!({ inode.header.i_links_count }, 1);
		assert!(state.uncorrected);
	}
}
