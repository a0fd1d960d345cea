//! Pass 3 — connectivity: makes sure every directory is reachable from the
//! root, fixes a directory's ".." entry when it disagrees with the dirent
//! that actually names it, and reconnects orphaned subtrees (and, from Pass
//! 4, orphaned files) into lost+found.
//!
//! Grounded in `original_source/fsck.ocfs2/pass3.c`'s `check_root`/
//! `fix_dot_dot`/`connect_directory`/`o2fsck_pass3`/`o2fsck_reconnect_file`.

use crate::error::{CheckError, CheckResult};
use crate::ondisk::dirent::{DirEntry, FILE_TYPE_DIR, FILE_TYPE_REGULAR};
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;

pub const LOST_AND_FOUND_NAME: &str = "lost+found";

pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	crate::verbosef!(state, "Pass 3: Checking directory connectivity");
	check_root(state, prompter)?;

	let root = state.fs.super_block.s_root_blkno;
	let sysdir = state.fs.system_dir_blkno;
	mark_connected(state, root)?;
	mark_connected(state, sysdir)?;

	let dirs: Vec<u64> = state.dir_parents.keys().copied().collect();
	let mut loop_no = 0u64;
	for ino in dirs {
		loop_no += 1;
		connect_directory(state, prompter, ino, loop_no)?;
	}
	Ok(())
}

fn mark_connected(state: &mut CheckerState, ino: u64) -> CheckResult<()> {
	state
		.dir_parents
		.get_mut(&ino)
		.ok_or_else(|| CheckError::internal(format!("directory inode {ino} wasn't marked as a directory in Pass 1")))?
		.connected = true;
	Ok(())
}

/// Preconditions: the root inode must exist and be a directory. This crate
/// has no block/cluster allocator anywhere to synthesize a root inode's
/// storage from nothing, so a missing root is unconditionally fatal here —
/// the original's own creation branch for this case is itself never
/// finished (it always prints a message and exits), so this doesn't regress
/// anything the original actually did.
fn check_root(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	let root = state.fs.super_block.s_root_blkno;
	if !state.used.test(root) {
		let message = "the root inode doesn't exist; fsck can't create one without a free-space allocator".to_string();
		state.confirm(prompter, PromptDefault::Yes, &message);
		return Err(CheckError::Cancelled);
	}
	if !state.dir.test(root) {
		return Err(CheckError::internal("the root inode exists but isn't a directory; a previous pass should have caught this"));
	}
	Ok(())
}

/// Ascends `start_ino`'s recorded ".." chain, stamping each directory visited
/// as connected before moving to its parent (everything on a walk that ends
/// either at an already-connected ancestor or at a successful lost+found
/// reconnection is, by the time this returns, actually connected). A cycle —
/// re-entering a node already stamped with this walk's `loop_no` — is treated
/// the same as reaching a directory with no recorded parent at all: the
/// subtree is orphaned and offered for reconnection.
fn connect_directory(state: &mut CheckerState, prompter: &mut dyn Prompter, start_ino: u64, loop_no: u64) -> CheckResult<()> {
	let mut cur = start_ino;
	loop {
		let already_connected = state.dir_parents.get(&cur).map(|dp| dp.connected).unwrap_or(false);
		if already_connected {
			break;
		}
		if let Some(dp) = state.dir_parents.get_mut(&cur) {
			dp.connected = true;
		}

		let dirent_parent = state.dir_parents.get(&cur).map(|dp| dp.dirent_parent).unwrap_or(0);
		if dirent_parent != 0 {
			let par_loop_no = state
				.dir_parents
				.get(&dirent_parent)
				.map(|dp| dp.loop_no)
				.ok_or_else(|| CheckError::internal(format!("no dir_parents entry for parent {dirent_parent} of directory {cur}")))?;
			if par_loop_no != loop_no {
				state.dir_parents.get_mut(&dirent_parent).unwrap().loop_no = loop_no;
				cur = dirent_parent;
				continue;
			}
			// par_loop_no == loop_no: we've already visited `dirent_parent`
			// earlier in this same walk, so ascending further would cycle.
		}

		let message = format!("directory inode {cur} isn't connected to the filesystem. Move it to lost+found?");
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			reconnect_file(state, cur)?;
		}
		break;
	}

	reconcile_dot_dot(state, prompter, start_ino)?;
	Ok(())
}

/// If `ino`'s recorded dirent-parent disagrees with what its own ".." entry
/// points at, offers to rewrite ".." to match. Grounded in `fix_dot_dot`/
/// `fix_dot_dot_dirent`. A `dirent_parent` of 0 means no directory entry
/// naming `ino` has been observed at all (true of the root and the system
/// directory, which nothing else points at) — that's not a mismatch to
/// report, just the absence of a fact to check against.
fn reconcile_dot_dot(state: &mut CheckerState, prompter: &mut dyn Prompter, ino: u64) -> CheckResult<()> {
	let (dirent_parent, dot_dot) = match state.dir_parents.get(&ino) {
		Some(dp) => (dp.dirent_parent, dp.dot_dot),
		None => return Ok(()),
	};
	if dirent_parent == 0 || dirent_parent == dot_dot {
		return Ok(());
	}

	let message = format!(
		"directory inode {ino} is referenced by a dirent in directory {dirent_parent} but its '..' entry points to {dot_dot}. Fix the '..' entry to reference {dirent_parent}?"
	);
	if state.confirm(prompter, PromptDefault::Yes, &message) {
		rewrite_dot_dot(state, ino, dirent_parent)?;
		state.dir_parents.get_mut(&ino).unwrap().dot_dot = dirent_parent;
	}
	Ok(())
}

/// Finds `ino`'s ".." entry across both directory storage shapes and
/// repoints it at `new_parent`, adjusting `icount_refs` on the old and new
/// targets the same way the original's `fix_dot_dot_dirent` does.
fn rewrite_dot_dot(state: &mut CheckerState, ino: u64, new_parent: u64) -> CheckResult<()> {
	let inode = state.fs.read_inode(ino)?;
	let is_inline = matches!(inode.body, crate::ondisk::inode::InodeBody::InlineData(_));

	let blkno = if is_inline { ino } else { find_dotdot_block(state, ino)? };
	let mut buf: Vec<u8> = match &inode.body {
		crate::ondisk::inode::InodeBody::InlineData(data) => data.to_vec(),
		_ => state.fs.read_dir_block(blkno)?,
	};

	// Collect first so the iterator's borrow of `buf` ends before we mutate it.
	let entries: Vec<(usize, DirEntry)> =
		crate::ondisk::dirent::iter_dir_block(&buf).filter_map(|(offset, r)| r.ok().map(|e| (offset, e))).collect();

	let mut old_target = None;
	for (offset, mut entry) in entries {
		if !entry.is_dotdot() {
			continue;
		}
		old_target = Some(entry.inode);
		entry.inode = new_parent;
		entry.encode_into(&mut buf[offset..offset + entry.rec_len as usize]);
		break;
	}

	if is_inline {
		let mut inode = inode;
		let mut data = [0u8; 256];
		let n = buf.len().min(256);
		data[..n].copy_from_slice(&buf[..n]);
		inode.body = crate::ondisk::inode::InodeBody::InlineData(data);
		state.fs.write_inode(ino, &inode)?;
	} else {
		state.fs.write_dir_block(blkno, &buf)?;
	}

	if let Some(old) = old_target {
		if old != 0 {
			state.icount_refs.delta(old, -1);
		}
	}
	state.icount_refs.delta(new_parent, 1);
	Ok(())
}

/// Locates the physical block that carries `ino`'s ".." entry (always the
/// directory's logical block 0).
fn find_dotdot_block(state: &mut CheckerState, ino: u64) -> CheckResult<u64> {
	let inode = state.fs.read_inode(ino)?;
	let el = inode
		.extent_list()
		.ok_or_else(|| CheckError::internal(format!("directory inode {ino} has neither an extent list nor inline data")))?;
	let el = *el;
	let mut first = None;
	state.fs.dir_iterate(&el, el.l_tree_depth, |blkno, _buf| {
		if first.is_none() {
			first = Some(blkno);
		}
		Ok(())
	})?;
	first.ok_or_else(|| CheckError::internal(format!("directory inode {ino} has no directory blocks")))
}

/// Adds an inode to lost+found, the same operation the original's
/// `o2fsck_reconnect_file` is always called for but never actually
/// implements (it's a stub that calls `fatal_error`, read directly in
/// `pass3.c`). Used both for directories orphaned by `connect_directory` and
/// for files Pass 4 finds with no surviving dirent.
pub fn reconnect_file(state: &mut CheckerState, ino: u64) -> CheckResult<()> {
	let lost_and_found = find_lost_and_found(state)?;
	let is_dir = state.fs.read_inode(ino)?.is_dir();
	let name = ino.to_string();
	let file_type = if is_dir { FILE_TYPE_DIR } else { FILE_TYPE_REGULAR };

	add_dirent(state, lost_and_found, &name, ino, file_type)?;
	state.icount_refs.delta(ino, 1);

	if is_dir {
		state.dir_parents.entry(ino).or_insert_with(|| crate::state::DirParent::new(lost_and_found)).dirent_parent = lost_and_found;
		rewrite_dot_dot(state, ino, lost_and_found)?;
		state.dir_parents.get_mut(&ino).unwrap().dot_dot = lost_and_found;
	}
	Ok(())
}

fn find_lost_and_found(state: &mut CheckerState) -> CheckResult<u64> {
	let root = state.fs.super_block.s_root_blkno;
	let inode = state.fs.read_inode(root)?;
	let entries = state.fs.read_dirents(&inode)?;
	for entry in entries {
		if !entry.is_deleted() && entry.name == LOST_AND_FOUND_NAME.as_bytes() {
			return Ok(entry.inode);
		}
	}
	Err(CheckError::corrupt("no lost+found directory exists under the root directory"))
}

/// Appends a dirent to `dir_ino`, reusing a deleted entry's span or the
/// trailing slack of the last entry in its final block if either is big
/// enough. This crate has no free-space allocator to grow a directory with a
/// fresh block when neither is, so that case is reported and left
/// unresolved rather than attempted.
fn add_dirent(state: &mut CheckerState, dir_ino: u64, name: &str, target: u64, file_type: u8) -> CheckResult<()> {
	let needed = DirEntry::rec_len_for_name(name.len() as u8);
	let mut inode = state.fs.read_inode(dir_ino)?;

	if let crate::ondisk::inode::InodeBody::InlineData(data) = &inode.body {
		let mut buf = data.to_vec();
		if try_place_dirent(&mut buf, needed, name, target, file_type) {
			let mut new_data = [0u8; 256];
			let n = buf.len().min(256);
			new_data[..n].copy_from_slice(&buf[..n]);
			inode.body = crate::ondisk::inode::InodeBody::InlineData(new_data);
			state.fs.write_inode(dir_ino, &inode)?;
			return Ok(());
		}
	} else {
		let el = *inode
			.extent_list()
			.ok_or_else(|| CheckError::internal(format!("directory inode {dir_ino} has no extent list")))?;
		let mut blocks = Vec::new();
		state.fs.dir_iterate(&el, el.l_tree_depth, |blkno, _buf| {
			blocks.push(blkno);
			Ok(())
		})?;

		for blkno in blocks {
			let mut buf = state.fs.read_dir_block(blkno)?;
			if try_place_dirent(&mut buf, needed, name, target, file_type) {
				state.fs.write_dir_block(blkno, &buf)?;
				return Ok(());
			}
		}
	}

	state.uncorrected = true;
	Err(CheckError::bad_range(format!(
		"lost+found has no room for an entry naming inode {target}; it needs a larger directory than this checker can allocate"
	)))
}

/// Tries to fit a new entry into `buf`: reuses the first deleted entry whose
/// span is large enough, otherwise splits the trailing slack of the last
/// entry if that has room. Returns whether `buf` was changed.
fn try_place_dirent(buf: &mut [u8], needed: u16, name: &str, target: u64, file_type: u8) -> bool {
	// Collect first: iter_dir_block borrows `buf` immutably, and that borrow
	// must end before any of the encode_into calls below can mutate it.
	let entries: Vec<(usize, DirEntry)> =
		crate::ondisk::dirent::iter_dir_block(&*buf).filter_map(|(offset, r)| r.ok().map(|e| (offset, e))).collect();

	let mut last: Option<(usize, DirEntry)> = None;
	for (offset, entry) in entries {
		if entry.is_deleted() && entry.rec_len >= needed {
			let new_entry = DirEntry { inode: target, rec_len: entry.rec_len, name_len: name.len() as u8, file_type, name: name.as_bytes().to_vec() };
			new_entry.encode_into(&mut buf[offset..offset + entry.rec_len as usize]);
			return true;
		}
		last = Some((offset, entry));
	}

	if let Some((offset, entry)) = last {
		let min_len = DirEntry::rec_len_for_name(entry.name_len);
		let slack = entry.rec_len - min_len;
		if slack >= needed {
			let mut shrunk = entry.clone();
			shrunk.rec_len = min_len;
			shrunk.encode_into(&mut buf[offset..offset + min_len as usize]);

			let new_offset = offset + min_len as usize;
			let new_entry = DirEntry { inode: target, rec_len: slack, name_len: name.len() as u8, file_type, name: name.as_bytes().to_vec() };
			new_entry.encode_into(&mut buf[new_offset..new_offset + slack as usize]);
			return true;
		}
	}

	false
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::MemBlockDevice;
	use crate::ondisk::extent::{ExtentList, ExtentRec, MAX_INLINE_EXTENT_RECS};
	use crate::ondisk::fs::Filesystem;
	use crate::ondisk::inode::{DInode, DInodeHeader, InodeBody, DINODE_SIGNATURE, S_IFDIR, S_IFREG, VALID_FL};
	use crate::ondisk::superblock::{SuperBlock, SUPERBLOCK_SIGNATURE};
	use crate::prompt::ScriptedPrompter;
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

	fn write_dir(state: &mut CheckerState, blkno: u64, data_blkno: u64) {
		let mut el = ExtentList {
			l_count: 32,
			l_next_free_rec: 1,
			l_tree_depth: 0,
			_pad0: 0,
			recs: [ExtentRec { e_cpos: 0, e_clusters: 0, e_leaf_clusters: 0, e_blkno: 0 }; MAX_INLINE_EXTENT_RECS],
		};
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
		state.used.set(blkno);
		state.dir.set(blkno);
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
		state.used.set(blkno);
	}

	/// Writes `entries` into the block and, if they don't already span the
	/// whole block, appends a deleted filler entry covering the remainder —
	/// the state Pass 2 always leaves a block in, which Pass 3 depends on.
	fn write_block(state: &mut CheckerState, blkno: u64, entries: &[DirEntry]) {
		let bs = state.fs.block_size() as usize;
		let mut buf = vec![0u8; bs];
		let mut offset = 0usize;
		for e in entries {
			e.encode_into(&mut buf[offset..offset + e.rec_len as usize]);
			offset += e.rec_len as usize;
		}
		if offset < bs {
			let filler = DirEntry { inode: 0, rec_len: (bs - offset) as u16, name_len: 0, file_type: 0, name: Vec::new() };
			filler.encode_into(&mut buf[offset..bs]);
		}
		state.fs.dev.write_block(blkno, &buf).unwrap();
	}

	fn dot(ino: u64) -> DirEntry {
		DirEntry { inode: ino, rec_len: 16, name_len: 1, file_type: FILE_TYPE_DIR, name: b".".to_vec() }
	}
	fn dotdot(ino: u64) -> DirEntry {
		DirEntry { inode: ino, rec_len: 16, name_len: 2, file_type: FILE_TYPE_DIR, name: b"..".to_vec() }
	}

	#[test]
	fn root_and_sysdir_start_connected() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_dir(&mut state, 4, 201);
		write_block(&mut state, 200, &[dot(3), dotdot(3)]);
		write_block(&mut state, 201, &[dot(4), dotdot(4)]);
		state.dir_parents.insert(3, DirParent::new(3));
		state.dir_parents.insert(4, DirParent::new(4));

		let mut prompter = ScriptedPrompter::new([]);
		run(&mut state, &mut prompter).unwrap();

		assert!(state.dir_parents.get(&3).unwrap().connected);
		assert!(state.dir_parents.get(&4).unwrap().connected);
	}

	#[test]
	fn directory_reachable_through_parent_chain_is_connected() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_dir(&mut state, 4, 201);
		write_dir(&mut state, 60, 210);
		write_block(&mut state, 200, &[dot(3), dotdot(3)]);
		write_block(&mut state, 201, &[dot(4), dotdot(4)]);
		write_block(&mut state, 210, &[dot(60), dotdot(3)]);

		state.dir_parents.insert(3, DirParent::new(3));
		state.dir_parents.insert(4, DirParent::new(4));
		let mut dp = DirParent::new(3);
		dp.dirent_parent = 3;
		state.dir_parents.insert(60, dp);

		let mut prompter = ScriptedPrompter::new([]);
		run(&mut state, &mut prompter).unwrap();

		assert!(state.dir_parents.get(&60).unwrap().connected);
	}

	#[test]
	fn orphaned_directory_is_offered_reconnection_to_lost_and_found() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_dir(&mut state, 4, 201);
		write_dir(&mut state, 70, 220); // lost+found
		write_dir(&mut state, 60, 210); // orphan

		write_block(&mut state, 200, &[dot(3), dotdot(3), DirEntry { inode: 70, rec_len: 480, name_len: 10, file_type: FILE_TYPE_DIR, name: b"lost+found".to_vec() }]);
		write_block(&mut state, 201, &[dot(4), dotdot(4)]);
		write_block(&mut state, 220, &[dot(70), dotdot(3)]);
		write_block(&mut state, 210, &[dot(60), dotdot(999)]);

		state.dir_parents.insert(3, DirParent::new(3));
		state.dir_parents.insert(4, DirParent::new(4));
		let mut lf = DirParent::new(3);
		lf.dirent_parent = 3;
		state.dir_parents.insert(70, lf);
		let mut orphan = DirParent::new(999);
		orphan.dirent_parent = 0;
		state.dir_parents.insert(60, orphan);

		let mut prompter = ScriptedPrompter::always_yes();
		run(&mut state, &mut prompter).unwrap();

		assert!(state.dir_parents.get(&60).unwrap().connected);
		assert_eq!(state.dir_parents.get(&60).unwrap().dirent_parent, 70);

		let lf_inode = state.fs.read_inode(70).unwrap();
		let entries = state.fs.read_dirents(&lf_inode).unwrap();
		assert!(entries.iter().any(|e| e.inode == 60 && e.name == b"60"));
	}

	#[test]
	fn mismatched_dot_dot_is_rewritten_on_yes() {
		let mut state = new_state();
		write_dir(&mut state, 3, 200);
		write_dir(&mut state, 60, 210);
		write_block(&mut state, 200, &[dot(3), dotdot(3), DirEntry { inode: 60, rec_len: 480, name_len: 3, file_type: FILE_TYPE_DIR, name: b"sub".to_vec() }]);
		write_block(&mut state, 210, &[dot(60), dotdot(999)]);

		state.dir_parents.insert(3, DirParent::new(3));
		let mut dp = DirParent::new(999);
		dp.dirent_parent = 3;
		state.dir_parents.insert(60, dp);
		state.dir_parents.get_mut(&3).unwrap().connected = true;

		let mut prompter = ScriptedPrompter::always_yes();
		run(&mut state, &mut prompter).unwrap();

		let back = state.fs.read_inode(60).unwrap();
		let entries = state.fs.read_dirents(&back).unwrap();
		let dotdot_entry = entries.iter().find(|e| e.is_dotdot()).unwrap();
		assert_eq!(dotdot_entry.inode, 3);
		assert_eq!(state.dir_parents.get(&60).unwrap().dot_dot, 3);
	}

	#[test]
	fn missing_root_is_fatal() {
		let mut state = new_state();
		let mut prompter = ScriptedPrompter::always_yes();
		let err = run(&mut state, &mut prompter).unwrap_err();
		assert!(matches!(err, CheckError::Cancelled));
	}
}
