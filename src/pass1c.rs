//! Pass 1c — assigns human-readable paths to every duplicate-owning inode.
//!
//! Grounded in `original_source/fsck.ocfs2/pass1b.c`'s `o2fsck_pass1c`/
//! `push_dir`/`name_inode`/`walk_cwd`/`de_to_path`: a best-effort
//! breadth-first walk of the directory tree starting from the root and the
//! system directory, naming every inode the duplicate context is still
//! missing a path for as it's discovered. Errors reading a directory are
//! logged once and otherwise ignored — the tree hasn't been repaired yet at
//! this point in the pipeline, and the walk exists only to give the user
//! readable names. The walk stops as soon as every duplicate-owning inode
//! has a path.

use crate::error::CheckResult;
use crate::ondisk::dirent::{DirEntry, FILE_TYPE_DIR};
use crate::pass1b::DuplicateContext;
use crate::state::CheckerState;
use std::collections::VecDeque;

pub fn run(state: &mut CheckerState, ctx: &mut DuplicateContext) {
	if ctx.dup_inodes.is_empty() {
		return;
	}
	crate::verbosef!(state, "Pass 1c: Determining the names of inodes owning multiply-claimed clusters");

	let mut remaining = ctx.dup_inodes.len();
	let mut queue: VecDeque<(u64, String)> = VecDeque::new();
	queue.push_back((state.fs.super_block.s_root_blkno, "/".to_string()));
	queue.push_back((state.fs.system_dir_blkno, "//".to_string()));

	let mut warned = false;
	while remaining > 0 {
		let (dir_ino, cwd) = match queue.pop_front() {
			Some(next) => next,
			None => break,
		};

		name_inode(ctx, dir_ino, &cwd, &mut remaining);
		if remaining == 0 {
			break;
		}

		let entries = match read_dir_entries(state, dir_ino) {
			Ok(entries) => entries,
			Err(_) => {
				if !warned {
					warned = true;
					crate::verbosef!(state, "error finding path names in Pass 1c; some inodes may be reported by number instead");
				}
				continue;
			}
		};

		for entry in entries {
			if entry.is_deleted() || entry.is_dot() || entry.is_dotdot() {
				continue;
			}
			let name = String::from_utf8_lossy(&entry.name).into_owned();
			let path = child_path(&cwd, &name);
			if entry.file_type == FILE_TYPE_DIR {
				queue.push_back((entry.inode, path));
			} else {
				name_inode(ctx, entry.inode, &path, &mut remaining);
			}
		}
	}
}

/// Assigns `path` to `ino` if it's a still-unnamed duplicate-owning inode.
fn name_inode(ctx: &mut DuplicateContext, ino: u64, path: &str, remaining: &mut usize) {
	if let Some(di) = ctx.dup_inodes.get_mut(&ino) {
		if di.path.is_none() {
			di.path = Some(path.to_string());
			*remaining -= 1;
		}
	}
}

fn child_path(cwd: &str, name: &str) -> String {
	if cwd.ends_with('/') {
		format!("{cwd}{name}")
	} else {
		format!("{cwd}/{name}")
	}
}

/// Reads every non-deleted dirent out of `dir_ino`'s directory blocks,
/// covering both extent-tree-bodied and inline directories.
fn read_dir_entries(state: &mut CheckerState, dir_ino: u64) -> CheckResult<Vec<DirEntry>> {
	let inode = state.fs.read_inode(dir_ino)?;
	Ok(state.fs.read_dirents(&inode)?)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::MemBlockDevice;
	use crate::ondisk::extent::{ExtentList, ExtentRec, MAX_INLINE_EXTENT_RECS};
	use crate::ondisk::fs::Filesystem;
	use crate::ondisk::inode::{DInode, DInodeHeader, InodeBody, DINODE_SIGNATURE, S_IFDIR, S_IFREG, VALID_FL};
	use crate::ondisk::superblock::{SuperBlock, SUPERBLOCK_SIGNATURE};
	use crate::ondisk::dirent::FILE_TYPE_REGULAR;

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

	fn write_dir(state: &mut CheckerState, blkno: u64, data_blkno: u64) {
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
				i_links_count: 2,
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
	}

	fn write_file(state: &mut CheckerState, blkno: u64) {
		let inode = DInode {
			header: DInodeHeader {
				i_signature: DINODE_SIGNATURE,
				i_generation: 1,
				i_flags: VALID_FL,
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

	fn write_dirblock(state: &mut CheckerState, blkno: u64, entries: &[DirEntry]) {
		let bs = state.fs.block_size() as usize;
		let mut buf = vec![0u8; bs];
		let mut offset = 0usize;
		for e in entries {
			e.encode_into(&mut buf[offset..offset + e.rec_len as usize]);
			offset += e.rec_len as usize;
		}
		state.fs.dev.write_block(blkno, &buf).unwrap();
	}

	#[test]
	fn root_and_sysdir_are_seeded_even_without_duplicates() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_dir(&mut state, 4, 201);
		write_dirblock(&mut state, 200, &[]);
		write_dirblock(&mut state, 201, &[]);

		let mut ctx = DuplicateContext::new();
		run(&mut state, &mut ctx);
		assert!(ctx.dup_inodes.is_empty());
	}

	#[test]
	fn file_reachable_from_root_gets_a_path() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_file(&mut state, 50);
		write_dirblock(
			&mut state,
			200,
			&[DirEntry { inode: 50, rec_len: 512, name_len: 5, file_type: FILE_TYPE_REGULAR, name: b"hello".to_vec() }],
		);
		write_dir(&mut state, 4, 201);
		write_dirblock(&mut state, 201, &[]);

		let mut ctx = DuplicateContext::new();
		ctx.dup_inodes.insert(50, crate::pass1b::DupInode::default());

		run(&mut state, &mut ctx);
		assert_eq!(ctx.dup_inodes.get(&50).unwrap().path.as_deref(), Some("/hello"));
	}

	#[test]
	fn directory_itself_can_be_named() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_dir(&mut state, 4, 201);
		write_dirblock(&mut state, 200, &[]);
		write_dirblock(&mut state, 201, &[]);

		let mut ctx = DuplicateContext::new();
		ctx.dup_inodes.insert(3, crate::pass1b::DupInode::default());

		run(&mut state, &mut ctx);
		assert_eq!(ctx.dup_inodes.get(&3).unwrap().path.as_deref(), Some("/"));
	}

	#[test]
	fn walk_stops_early_once_every_duplicate_is_named() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_file(&mut state, 50);
		write_dirblock(
			&mut state,
			200,
			&[DirEntry { inode: 50, rec_len: 512, name_len: 5, file_type: FILE_TYPE_REGULAR, name: b"hello".to_vec() }],
		);
		// The system directory is deliberately left unwritten: if the walk
		// didn't stop early it would error trying to read it.
		let mut ctx = DuplicateContext::new();
		ctx.dup_inodes.insert(50, crate::pass1b::DupInode::default());

		run(&mut state, &mut ctx);
		assert_eq!(ctx.dup_inodes.get(&50).unwrap().path.as_deref(), Some("/hello"));
	}
}
