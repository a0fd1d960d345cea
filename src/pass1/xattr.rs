//! Extended-attribute walk, run once per inode that has `HAS_XATTR_FL` set.
//!
//! Grounded in `fsck.ocfs2/xattr.c`'s `check_xattr_count`/`check_xattr_entry`:
//! an inode's xattrs stored inline in the dinode body are left alone (this
//! crate's `InodeBody` has no inline-xattr region distinct from
//! `InlineData`, so inline xattrs have nothing separate to corrupt here);
//! external xattrs live in a single-block bucket pointed to by
//! `i_xattr_loc`, and this walk validates and repairs that bucket's header.

use crate::error::CheckResult;
use crate::ondisk::inode::{DInode, HAS_XATTR_FL, INLINE_XATTR_FL};
use crate::ondisk::xattr::{XattrBucket, MAX_XATTR_ENTRIES};
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;

pub fn check_xattr(state: &mut CheckerState, prompter: &mut dyn Prompter, inode_blkno: u64, inode: &mut DInode) -> CheckResult<()> {
	if !inode.has_xattr() || inode.header.i_dyn_features & INLINE_XATTR_FL != 0 {
		return Ok(());
	}

	let xattr_blkno = inode.header.i_xattr_loc;
	if xattr_blkno == 0 || xattr_blkno >= state.fs.dev.block_count() {
		let message = format!(
			"inode {inode_blkno} has HAS_XATTR_FL set but i_xattr_loc ({xattr_blkno}) is out of range; clear the flag"
		);
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			inode.header.i_dyn_features &= !HAS_XATTR_FL;
		}
		return Ok(());
	}

	let bs = state.fs.block_size() as usize;
	let mut buf = vec![0u8; bs];
	state.fs.dev.read_block(xattr_blkno, &mut buf)?;
	let mut bucket = match XattrBucket::read(&buf) {
		Ok(b) => b,
		Err(_) => return Ok(()),
	};

	let was_dup = state.mark_found_block(xattr_blkno);
	if was_dup {
		crate::verbosef!(state, "xattr block {xattr_blkno} claimed by more than one inode");
	}

	let mut dirty = false;
	let header = &mut bucket.xb_header;
	if header.xh_count as usize > MAX_XATTR_ENTRIES {
		let count = header.xh_count;
		let message = format!("inode {inode_blkno}'s xattr bucket at block {xattr_blkno} has xh_count={count}; clamp");
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			header.xh_count = MAX_XATTR_ENTRIES as u16;
			dirty = true;
		}
	}

	let header_bytes_used = std::mem::size_of::<crate::ondisk::xattr::XattrHeader>() as u16;
	let stale_free_start = header.xh_free_start;
	let stale_name_value_len = header.xh_name_value_len;
	header.recompute_free_region(header_bytes_used);
	if header.xh_free_start != stale_free_start || header.xh_name_value_len != stale_name_value_len {
		crate::verbosef!(state, "inode {inode_blkno}'s xattr bucket at block {xattr_blkno} had a stale free region; recomputed");
		dirty = true;
	}

	if dirty {
		bucket.write_into(&mut buf)?;
		state.fs.dev.write_block(xattr_blkno, &buf)?;
	}
	Ok(())
}
