//! Pass 2 — validates and repairs the directory entries of every block Pass 1
//! registered in `CheckerState::dirblocks`, then records the references those
//! entries make into `icount_refs` and `dir_parents`.
//!
//! Grounded in `original_source/fsck.ocfs2/pass2.c`'s `fix_dirent_lengths`/
//! `fix_dirent_dots`/`pass2_dir_block_iterate`/`o2fsck_pass2`, and
//! `dirblocks.c`'s `o2fsck_dir_block_iterate` for the block-by-block drive.

use crate::error::CheckResult;
use crate::ondisk::dirent::{iter_dir_block, DirEntry, FILE_TYPE_UNKNOWN};
use crate::ondisk::inode::InodeBody;
use crate::prompt::{Prompter, PromptDefault};
use crate::state::{CheckerState, DirParent};

pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	let blocks: Vec<(u64, crate::state::DirBlockEntry)> = state.dirblocks.iter().map(|(&b, &e)| (b, e)).collect();
	for (blkno, entry) in blocks {
		process_block(state, prompter, blkno, entry)?;
	}
	Ok(())
}

fn process_block(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	blkno: u64,
	entry: crate::state::DirBlockEntry,
) -> CheckResult<()> {
	let mut inode = match state.fs.read_inode(entry.ino) {
		Ok(inode) if inode.has_signature() => inode,
		_ => return Ok(()),
	};
	let is_inline = matches!(inode.body, InodeBody::InlineData(_));
	let mut buf: Vec<u8> = match &inode.body {
		InodeBody::InlineData(data) => data.to_vec(),
		_ => state.fs.read_dir_block(blkno)?,
	};

	let changed = repair_block(state, prompter, entry.ino, entry.blkcount, &mut buf);

	if changed {
		if is_inline {
			let mut data = [0u8; 256];
			let n = buf.len().min(256);
			data[..n].copy_from_slice(&buf[..n]);
			inode.body = InodeBody::InlineData(data);
			state.fs.write_inode(entry.ino, &inode)?;
		} else {
			state.fs.write_dir_block(blkno, &buf)?;
		}
	}

	register_refs(state, entry.ino, entry.blkcount, &buf);
	Ok(())
}

/// Walks one directory block's entries, repairing length and dot-entry
/// problems in place. Returns whether any byte in `buf` was rewritten.
fn repair_block(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	owner_ino: u64,
	blkcount: u64,
	buf: &mut [u8],
) -> bool {
	let mut changed = false;
	let mut offset = 0usize;
	let mut prev_offset: Option<usize> = None;

	while offset < buf.len() {
		let left = buf.len() - offset;
		let entry = match DirEntry::decode(&buf[offset..]) {
			Ok((entry, _consumed)) => entry,
			Err(_) => {
				buf[offset..].fill(0);
				changed = true;
				break;
			}
		};

		if !length_is_sane(&entry, left) {
			changed = true;
			if !fix_dirent_lengths(state, prompter, owner_ino, blkcount, offset, left, buf, prev_offset) {
				// The corrupt entry's space was folded into the previous
				// entry, which now spans to the end of the block.
				break;
			}
			// The entry at `offset` was rewritten into a valid (possibly
			// zeroed) record; re-examine it on the next iteration rather
			// than trusting the stale copy decoded above.
			continue;
		}

		let mut entry = entry;
		changed |= fix_dirent_dots(state, prompter, owner_ino, blkcount, offset, left, &mut entry, buf);

		offset += entry.rec_len as usize;
		prev_offset = Some(prev_offset_after(offset, entry.rec_len));
	}

	changed
}

fn prev_offset_after(offset_after: usize, rec_len: u16) -> usize {
	offset_after - rec_len as usize
}

fn length_is_sane(entry: &DirEntry, left: usize) -> bool {
	entry.rec_len >= DirEntry::MIN_REC_LEN
		&& entry.rec_len % 4 == 0
		&& (entry.rec_len as usize) <= left
		&& DirEntry::rec_len_for_name(entry.name_len) <= entry.rec_len
}

/// Repairs a dirent whose length fields fail [`length_is_sane`]. Returns
/// `true` if the loop should continue examining `buf[offset..]` (the entry
/// there was rewritten to something valid), `false` if the previous entry
/// absorbed the rest of the block and the caller should stop.
///
/// Grounded in `fix_dirent_lengths`, with one correction: the original's
/// "fold this entry's space into the previous entry" branch leaves the
/// current entry's bytes untouched and returns "changed", which (since the
/// caller re-examines the same offset without advancing past it on any
/// change) reapplies the same fold forever. Growing `prev`'s `rec_len` only
/// makes sense if nothing after it is examined again, so this version stops
/// the walk outright instead of looping.
fn fix_dirent_lengths(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	owner_ino: u64,
	blkcount: u64,
	offset: usize,
	left: usize,
	buf: &mut [u8],
	prev_offset: Option<usize>,
) -> bool {
	let message = format!(
		"directory inode {owner_ino} corrupted in logical block {blkcount} physical offset {offset}; repair its entries"
	);
	state.confirm(prompter, PromptDefault::Yes, &message);

	// A bare, empty header with no rounding slop: drop it by shifting
	// everything after it down and zeroing the freed tail.
	if left >= DirEntry::MIN_REC_LEN as usize {
		let rec_len = u16::from_le_bytes(buf[offset + 8..offset + 10].try_into().unwrap()) as usize;
		if rec_len == DirEntry::MIN_REC_LEN as usize {
			buf.copy_within(offset + rec_len..offset + left, offset);
			buf[offset + left - rec_len..offset + left].fill(0);
			return true;
		}
	}

	let name_len = buf[offset + 10] as usize;
	let rec_len = u16::from_le_bytes(buf[offset + 8..offset + 10].try_into().unwrap()) as usize;

	// Clamp to the remainder of the block when the name itself still fits.
	if rec_len > left && name_len <= left {
		buf[offset + 8..offset + 10].copy_from_slice(&(left as u16).to_le_bytes());
		return true;
	}

	// Trust this entry's own length enough to fold it into the previous
	// one if it's at least well-formed (aligned, within the block).
	if let Some(prev_offset) = prev_offset {
		if rec_len % 4 == 0 && rec_len <= left {
			let prev_rec_len = u16::from_le_bytes(buf[prev_offset + 8..prev_offset + 10].try_into().unwrap());
			let new_len = prev_rec_len as usize + left;
			buf[prev_offset + 8..prev_offset + 10].copy_from_slice(&(new_len as u16).to_le_bytes());
			return false;
		}
	}

	// No usable previous entry (or this one's length can't be trusted
	// either): consume the rest of the block as a deleted entry.
	buf[offset + 8..offset + 10].copy_from_slice(&(left as u16).to_le_bytes());
	buf[offset + 10] = 0;
	buf[offset..offset + 8].fill(0);
	buf[offset + 11] = FILE_TYPE_UNKNOWN;
	true
}

fn dirent_has_dots(entry: &DirEntry, num_dots: u8) -> bool {
	if !(1..=2).contains(&num_dots) || entry.name_len != num_dots {
		return false;
	}
	if num_dots == 2 {
		entry.name == b".."
	} else {
		entry.name == b"."
	}
}

/// Repairs the dot-entry problems [`length_is_sane`] doesn't cover: a
/// duplicate "." or ".." outside its rightful position, a missing or
/// misdirected "." target, and reclaiming slop left over in an oversized "."
/// entry. Writes the (possibly updated) `entry` back into `buf` when it
/// changes anything. Returns whether `buf` was rewritten.
fn fix_dirent_dots(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	owner_ino: u64,
	blkcount: u64,
	offset: usize,
	left: usize,
	entry: &mut DirEntry,
	buf: &mut [u8],
) -> bool {
	let expect_dots = if blkcount == 0 {
		if offset == 0 {
			1
		} else if offset as u16 == DirEntry::rec_len_for_name(1) {
			2
		} else {
			0
		}
	} else {
		0
	};

	let mut changed = false;

	if expect_dots == 0 {
		if dirent_has_dots(entry, 1) || dirent_has_dots(entry, 2) {
			let name = String::from_utf8_lossy(&entry.name).into_owned();
			let message = format!("duplicate '{name}' directory entry found in inode {owner_ino}; remove?");
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				entry.inode = 0;
				buf[offset..offset + 8].fill(0);
				changed = true;
			}
		}
		return changed;
	}

	let mut name_len_changed = false;
	if !dirent_has_dots(entry, expect_dots) {
		let message = format!("inode {owner_ino}'s directory block is missing its '{}' entry; restore it", ".".repeat(expect_dots as usize));
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			entry.name_len = expect_dots;
			entry.name = vec![b'.'; expect_dots as usize];
			entry.encode_into(&mut buf[offset..offset + entry.rec_len as usize]);
			changed = true;
			name_len_changed = true;
		}
	}

	// ".."'s target is validated by connectivity repair, not here.
	if expect_dots == 2 {
		return changed;
	}

	if entry.inode != owner_ino {
		let message = format!("inode {owner_ino}'s '.' entry points at {}, not itself; fix?", entry.inode);
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			entry.inode = owner_ino;
			entry.encode_into(&mut buf[offset..offset + entry.rec_len as usize]);
			changed = true;
		}
	}

	let min_len = DirEntry::rec_len_for_name(entry.name_len);
	if entry.rec_len > min_len {
		let slop = entry.rec_len - min_len;
		let message = "'.' entry is too big; split the unused space into its own entry?".to_string();
		if name_len_changed || state.confirm(prompter, PromptDefault::No, &message) {
			entry.rec_len = min_len;
			entry.encode_into(&mut buf[offset..offset + min_len as usize]);

			let split_offset = offset + min_len as usize;
			let filler = DirEntry { inode: 0, rec_len: slop, name_len: 0, file_type: FILE_TYPE_UNKNOWN, name: Vec::new() };
			filler.encode_into(&mut buf[split_offset..split_offset + slop as usize]);
			changed = true;
		}
	}

	changed
}

/// Folds a repaired block's surviving entries into `icount_refs` and
/// `dir_parents`. A directory's own "." and ".." contribute real on-disk
/// links the same as any other entry; "." refers to `owner_ino` itself and
/// "..", read only at logical block 0, supplies `dir_parents[owner_ino]`'s
/// recorded parent. A non-dot entry naming a directory registers that
/// directory's `dirent_parent` as `owner_ino`.
fn register_refs(state: &mut CheckerState, owner_ino: u64, blkcount: u64, buf: &[u8]) {
	for (_, result) in iter_dir_block(buf) {
		let Ok(entry) = result else { continue };
		if entry.is_deleted() {
			continue;
		}
		state.icount_refs.delta(entry.inode, 1);

		if entry.is_dotdot() {
			if blkcount == 0 {
				state.dir_parents.entry(owner_ino).or_insert_with(|| DirParent::new(0)).dot_dot = entry.inode;
			}
			continue;
		}
		if entry.is_dot() {
			continue;
		}
		if state.dir.test(entry.inode) {
			state.dir_parents.entry(entry.inode).or_insert_with(|| DirParent::new(0)).dirent_parent = owner_ino;
		}
	}
}
