//! Per-slot journal replay: the precondition pass that makes on-disk
//! metadata reflect every committed transaction before Pass 0 ever runs.
//!
//! Grounded in `examples/original_source/fsck.ocfs2/journal.c`'s
//! `ocfs2_replay_journal`/two-sweep scan-then-apply structure. This module
//! consumes the on-disk layout types from [`crate::ondisk::journal`] but
//! does not define them, matching the original's split between
//! `jfs_compat.h` and `journal.c`.

use crate::error::CheckError;
use crate::ondisk::fs::Filesystem;
use crate::ondisk::inode::DInode;
use crate::ondisk::journal::{
	BlockTag, JournalHeader, JournalSuperblock, RevokeHeader, BLOCKTYPE_COMMIT, BLOCKTYPE_DESCRIPTOR,
	BLOCKTYPE_REVOKE, JOURNAL_MAGIC,
};
use crate::state::CheckerState;
use std::collections::BTreeMap;
use std::io;

/// Per-slot journal bookkeeping, live only for the duration of replay.
pub struct JournalInfo {
	pub slot: u16,
	pub inode_blkno: u64,
	pub inode: DInode,
	pub superblock: JournalSuperblock,
	/// Highest sequence number at which each block was revoked.
	pub revoke_set: BTreeMap<u64, u32>,
}

/// One payload block discovered during Sweep 1, queued for Sweep 2.
struct PendingWrite {
	/// The committing transaction's sequence number; a revoke entry at this
	/// sequence number or higher suppresses the write.
	seq: u32,
	target_blkno: u64,
	payload_logical: u32,
	escaped: bool,
}

struct PreparedSlot {
	info: JournalInfo,
	writes: Vec<PendingWrite>,
	final_seq: u32,
}

/// Wraps a logical journal block number back into `[first, maxlen)`, the
/// circular-log wrap arithmetic a replay sweep needs once it walks past the
/// journal's last block.
fn jwrap(block: u32, first: u32, maxlen: u32) -> u32 {
	if maxlen > first && block >= maxlen {
		first + (block - maxlen)
	} else {
		block
	}
}

pub struct Journal;

impl Journal {
	/// Examines every slot's journal inode and returns whether any is dirty.
	pub fn should_replay(fs: &mut Filesystem) -> io::Result<bool> {
		for slot in 0..fs.super_block.s_max_slots {
			let blkno = fs.lookup_system_inode("journal", Some(slot))?;
			let inode = fs.read_inode(blkno)?;
			if inode.is_dirty() {
				return Ok(true);
			}
		}
		Ok(false)
	}

	/// Replays every slot's journal. Two-phase: every slot is fully prepared
	/// (Sweep 1) before any slot's writes are applied (Sweep 2), so a
	/// mid-preparation failure leaves the disk untouched.
	///
	/// Takes the whole state rather than a bare `&mut Filesystem` so callers
	/// can't accidentally replay against a filesystem handle other than the
	/// one the rest of the run shares; `state.fs` and `state.verbose` are
	/// split into disjoint borrows internally rather than threading a second,
	/// separately-borrowed `Filesystem` alongside it.
	pub fn replay_all(state: &mut CheckerState) -> Result<(), CheckError> {
		let verbose = state.verbose;
		let fs = &mut state.fs;
		let mut prepared = Vec::new();
		for slot in 0..fs.super_block.s_max_slots {
			prepared.push(Self::prepare_slot(fs, slot)?);
		}

		for slot in &prepared {
			Self::apply_slot(fs, slot, verbose);
		}
		for slot in &prepared {
			Self::finalize_slot(fs, slot)?;
		}
		Ok(())
	}

	/// Sweep 1 for one slot: scans descriptor/commit/revoke blocks, recording
	/// every payload write Sweep 2 should perform and every revoked block.
	fn prepare_slot(fs: &mut Filesystem, slot: u16) -> Result<PreparedSlot, CheckError> {
		let inode_blkno = fs.lookup_system_inode("journal", Some(slot))?;
		let inode = fs.read_inode(inode_blkno)?;
		let bs = fs.block_size() as usize;

		let sb_phys = fs
			.extent_map_get_blocks(&inode, 0)?
			.ok_or_else(|| CheckError::corrupt(format!("slot {slot} journal has no superblock block")))?;
		let mut sb_buf = vec![0u8; bs];
		fs.dev.read_block(sb_phys, &mut sb_buf)?;
		let superblock = JournalSuperblock::read(&sb_buf)?;

		let mut revoke_set: BTreeMap<u64, u32> = BTreeMap::new();
		let mut writes = Vec::new();

		if !superblock.needs_replay() {
			let final_seq = superblock.s_sequence;
			return Ok(PreparedSlot {
				info: JournalInfo { slot, inode_blkno, inode, superblock, revoke_set },
				writes,
				final_seq,
			});
		}

		let first = superblock.s_first;
		let maxlen = superblock.s_maxlen;
		let mut logical = superblock.s_start;
		let mut sequence = superblock.s_sequence;
		let mut final_seq = sequence;

		loop {
			let phys = match fs.extent_map_get_blocks(&inode, logical as u64)? {
				Some(p) => p,
				None => break,
			};
			let mut blk = vec![0u8; bs];
			if fs.dev.read_block(phys, &mut blk).is_err() {
				break;
			}
			let header = match JournalHeader::read(&blk) {
				Ok(h) => h,
				Err(_) => break,
			};
			if !header.has_magic() || header.h_sequence != sequence {
				break;
			}

			if header.h_blocktype == BLOCKTYPE_DESCRIPTOR {
				let mut offset = std::mem::size_of::<JournalHeader>();
				let mut advanced = 0u32;
				loop {
					let tag = match BlockTag::read_at(&blk, offset) {
						Some(t) => t,
						None => break,
					};
					advanced += 1;
					let payload_logical = jwrap(logical.wrapping_add(advanced), first, maxlen);
					writes.push(PendingWrite {
						seq: sequence,
						target_blkno: tag.t_blocknr,
						payload_logical,
						escaped: tag.is_escaped(),
					});
					offset += BlockTag::ENCODED_LEN;
					if tag.is_last_tag() || offset + BlockTag::ENCODED_LEN > bs {
						break;
					}
				}
				logical = jwrap(logical.wrapping_add(1 + advanced), first, maxlen);
				final_seq = sequence;
			} else if header.h_blocktype == BLOCKTYPE_COMMIT {
				sequence = sequence.wrapping_add(1);
				final_seq = sequence;
				logical = jwrap(logical.wrapping_add(1), first, maxlen);
			} else if header.h_blocktype == BLOCKTYPE_REVOKE {
				if let Ok(rh) = RevokeHeader::read(&blk) {
					let count = rh.r_count as usize;
					if count >= RevokeHeader::ENCODED_LEN && count <= bs {
						for blkno in rh.revoked_blocks(&blk) {
							let entry = revoke_set.entry(blkno).or_insert(0);
							if sequence > *entry {
								*entry = sequence;
							}
						}
					}
				}
				final_seq = sequence;
				logical = jwrap(logical.wrapping_add(1), first, maxlen);
			} else {
				break;
			}
		}

		Ok(PreparedSlot {
			info: JournalInfo { slot, inode_blkno, inode, superblock, revoke_set },
			writes,
			final_seq,
		})
	}

	/// Sweep 2 for one slot: writes every non-revoked payload to its target
	/// block. Payload I/O errors are logged and skip that one write; they do
	/// not abort the whole replay.
	fn apply_slot(fs: &mut Filesystem, slot: &PreparedSlot, verbose: bool) {
		let bs = fs.block_size() as usize;
		macro_rules! vlog {
			($($arg:tt)*) => {
				if verbose {
					eprint!("{}:{} | ", module_path!(), line!());
					eprintln!($($arg)*);
				}
			};
		}
		for w in &slot.writes {
			if let Some(&revoked_at) = slot.info.revoke_set.get(&w.target_blkno) {
				if revoked_at >= w.seq {
					continue;
				}
			}

			let phys = match fs.extent_map_get_blocks(&slot.info.inode, w.payload_logical as u64) {
				Ok(Some(p)) => p,
				_ => {
					vlog!("journal slot {}: could not map payload block for target {}", slot.info.slot, w.target_blkno);
					continue;
				}
			};

			let mut payload = vec![0u8; bs];
			if fs.dev.read_block(phys, &mut payload).is_err() {
				vlog!("journal slot {}: read failed for payload block {phys}", slot.info.slot);
				continue;
			}
			if w.escaped && payload.len() >= 4 {
				payload[0..4].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
			}
			if fs.dev.write_block(w.target_blkno, &payload).is_err() {
				vlog!("journal slot {}: write failed for target block {}", slot.info.slot, w.target_blkno);
			}
		}
	}

	/// Rewrites the slot's journal superblock (`s_start = 0`,
	/// `s_sequence = final_seq + 1`) and clears the journal inode's dirty
	/// flag, making the replay durable.
	fn finalize_slot(fs: &mut Filesystem, slot: &PreparedSlot) -> Result<(), CheckError> {
		let bs = fs.block_size() as usize;
		let sb_phys = fs
			.extent_map_get_blocks(&slot.info.inode, 0)?
			.ok_or_else(|| CheckError::corrupt(format!("slot {} journal lost its superblock block", slot.info.slot)))?;

		let mut new_sb = slot.info.superblock;
		new_sb.s_start = 0;
		new_sb.s_sequence = slot.final_seq.wrapping_add(1);
		let mut buf = vec![0u8; bs];
		new_sb.write_into(&mut buf)?;
		fs.dev.write_block(sb_phys, &buf)?;

		let mut inode = fs.read_inode(slot.info.inode_blkno)?;
		inode.clear_dirty();
		fs.write_inode(slot.info.inode_blkno, &inode)?;
		Ok(())
	}
}
