//! Pass 0 — allocator verification.
//!
//! Grounded in `fsck.ocfs2/pass0.c`'s `o2fsck_pass0`/`check_chain`/
//! `check_group_desc`: load each chain-allocator inode (the global inode
//! allocator, then each slot's local inode allocator), clamp its chain-list
//! header, walk every chain fixing group-descriptor fields in place, and
//! truncate or drop chains that can't be trusted. A failure here is fatal —
//! later passes assume the allocators they scan are internally consistent.

use crate::error::CheckResult;
use crate::ondisk::chain::{GroupDesc, MAX_CHAINS};
use crate::ondisk::inode::DInode;
use crate::prompt::{Prompter, PromptDefault};
use crate::state::CheckerState;
use crate::verbosef;

/// Runs Pass 0 over the global inode allocator and every slot's local inode
/// allocator. Any lookup/read failure on an allocator inode is a fatal
/// [`crate::error::CheckError`]: later passes trust these allocators without
/// re-checking them, so a broken one aborts the whole run rather than being
/// patched around.
pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter) -> CheckResult<()> {
	let global_blkno = state.fs.lookup_system_inode("inode_alloc", None)?;
	verify_allocator(state, prompter, global_blkno)?;

	let max_slots = state.fs.super_block.s_max_slots;
	for slot in 0..max_slots {
		let blkno = state.fs.lookup_system_inode("inode_alloc", Some(slot))?;
		verify_allocator(state, prompter, blkno)?;
	}
	Ok(())
}

/// Result of walking one chain: either every descriptor after the head was
/// readable and well-signed (possibly truncated partway through), or the
/// head descriptor itself couldn't be trusted and the whole chain is a
/// deletion candidate.
enum ChainWalk {
	Walked { free_sum: u32, total_sum: u32 },
	HeadInvalid,
}

fn verify_allocator(state: &mut CheckerState, prompter: &mut dyn Prompter, inode_blkno: u64) -> CheckResult<()> {
	let mut inode = state.fs.read_inode(inode_blkno)?;
	if !inode.has_signature() || !inode.is_valid() || !inode.is_chain_allocator() {
		return Err(crate::error::CheckError::corrupt(format!(
			"allocator inode at block {inode_blkno} is missing its signature, VALID flag, or CHAIN flag"
		)));
	}
	let generation = inode.header.i_generation;

	{
		let cl = inode.chain_list_mut().expect("checked is_chain_allocator above");
		if cl.cl_count > MAX_CHAINS as u16 || cl.cl_next_free_rec > cl.cl_count {
			let count = cl.cl_count;
			let next_free = cl.cl_next_free_rec;
			let message = format!(
				"allocator inode {inode_blkno} chain-list header (count={count}, next_free={next_free}) exceeds the {MAX_CHAINS}-record maximum; clamp"
			);
			if state.confirm(prompter, PromptDefault::Yes, &message) {
				cl.clamp(MAX_CHAINS as u16);
			} else {
				return Err(crate::error::CheckError::Cancelled);
			}
		}
	}

	let mut free_total = 0u32;
	let mut used_total = 0u32;
	let mut i: usize = 0;
	loop {
		let next_free = inode.chain_list().unwrap().cl_next_free_rec as usize;
		if i >= next_free {
			break;
		}
		let chain_idx = i as u16;
		let head = inode.chain_list().unwrap().recs[i].c_blkno;

		match walk_chain(state, prompter, inode_blkno, generation, chain_idx, head)? {
			ChainWalk::Walked { free_sum, total_sum } => {
				free_total += free_sum;
				used_total += total_sum - free_sum;
				i += 1;
			}
			ChainWalk::HeadInvalid => {
				let message = format!(
					"chain {chain_idx} of allocator inode {inode_blkno} has an unreadable or unsigned head descriptor at block {head}; delete this chain"
				);
				if state.confirm(prompter, PromptDefault::Yes, &message) {
					inode.chain_list_mut().unwrap().remove_chain(i);
					// The chain that slid into slot `i` hasn't been walked yet.
				} else {
					return Err(crate::error::CheckError::Cancelled);
				}
			}
		}
	}

	reconcile_totals(state, prompter, &mut inode, inode_blkno, free_total, used_total)?;
	state.fs.write_inode(inode_blkno, &inode)?;
	Ok(())
}

/// Walks one chain starting at `head`, fixing individual group-descriptor
/// field mismatches in place and truncating the chain at the first
/// unreadable or unsigned descriptor after the head.
fn walk_chain(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode_blkno: u64,
	generation: u32,
	chain_idx: u16,
	head: u64,
) -> CheckResult<ChainWalk> {
	let mut free_sum = 0u32;
	let mut total_sum = 0u32;
	let mut prev: Option<(u64, GroupDesc)> = None;
	let mut blkno = head;

	while blkno != 0 {
		let read = state.fs.read_group_desc(blkno);
		let gd = match read {
			Ok(gd) if gd.has_signature() => gd,
			_ => {
				verbosef!(state, "group descriptor at block {blkno} unreadable or unsigned");
				return match prev {
					Some((prev_blkno, mut prev_gd)) => {
						let message = format!(
							"chain {chain_idx} of allocator inode {inode_blkno} breaks after descriptor at block {prev_blkno}; truncate here"
						);
						if state.confirm(prompter, PromptDefault::Yes, &message) {
							prev_gd.bg_next_group = 0;
							state.fs.write_group_desc(prev_blkno, &prev_gd)?;
							Ok(ChainWalk::Walked { free_sum, total_sum })
						} else {
							Err(crate::error::CheckError::Cancelled)
						}
					}
					None => Ok(ChainWalk::HeadInvalid),
				};
			}
		};

		let (gd, free, total) = verify_group_desc(state, prompter, inode_blkno, generation, chain_idx, blkno, gd)?;
		free_sum += free;
		total_sum += total;
		let next = gd.bg_next_group;
		prev = Some((blkno, gd));
		blkno = next;
	}

	Ok(ChainWalk::Walked { free_sum, total_sum })
}

/// Cross-checks one already-signature-verified descriptor's fields against
/// its owning allocator and chain, repairing in place. Returns the
/// (possibly repaired) descriptor plus its free/total bit counts.
fn verify_group_desc(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode_blkno: u64,
	generation: u32,
	chain_idx: u16,
	blkno: u64,
	mut gd: GroupDesc,
) -> CheckResult<(GroupDesc, u32, u32)> {
	let mut dirty = false;

	if { gd.bg_parent_dinode } != inode_blkno {
		let message = format!(
			"group descriptor at block {blkno} claims parent inode {} but is owned by {inode_blkno}; fix",
			{ gd.bg_parent_dinode }
		);
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			gd.bg_parent_dinode = inode_blkno;
			dirty = true;
		}
	}

	if { gd.bg_generation } != generation {
		let message = format!(
			"group descriptor at block {blkno} has generation {} but its allocator's generation is {generation}; fix",
			{ gd.bg_generation }
		);
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			gd.bg_generation = generation;
			dirty = true;
		}
	}

	if { gd.bg_blkno } != blkno {
		let message = format!(
			"group descriptor read from block {blkno} records bg_blkno={}; fix",
			{ gd.bg_blkno }
		);
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			gd.bg_blkno = blkno;
			dirty = true;
		}
	}

	if { gd.bg_chain } != chain_idx {
		let message = format!(
			"group descriptor at block {blkno} records chain index {} but is linked from chain {chain_idx}; fix",
			{ gd.bg_chain }
		);
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			gd.bg_chain = chain_idx;
			dirty = true;
		}
	}

	if { gd.bg_free_bits_count } > { gd.bg_bits_count } {
		let message = format!(
			"group descriptor at block {blkno} has free-bits-count {} exceeding its total {}; clamp",
			{ gd.bg_free_bits_count },
			{ gd.bg_bits_count }
		);
		if state.confirm(prompter, PromptDefault::Ask, &message) {
			gd.bg_free_bits_count = gd.bg_bits_count;
			dirty = true;
		}
	}

	if dirty {
		state.fs.write_group_desc(blkno, &gd)?;
	}

	Ok((gd, gd.bg_free_bits_count, gd.bg_bits_count))
}

/// Reconciles the allocator inode's recorded bitmap1 totals against the sum
/// observed while walking its chains, offering to overwrite the counters on
/// mismatch. The original's `i_clusters`/`i_used` pair generalizes here to
/// the header's `i_clusters` (total) against the observed total, since this
/// crate's `DInodeHeader` doesn't carry a separate free-count field.
fn reconcile_totals(
	state: &mut CheckerState,
	prompter: &mut dyn Prompter,
	inode: &mut DInode,
	inode_blkno: u64,
	free_total: u32,
	used_total: u32,
) -> CheckResult<()> {
	let observed = free_total + used_total;
	if inode.header.i_clusters != observed {
		let message = format!(
			"allocator inode {inode_blkno} records {} total bits but its chains account for {observed}; overwrite",
			{ inode.header.i_clusters }
		);
		if state.confirm(prompter, PromptDefault::Yes, &message) {
			inode.header.i_clusters = observed;
		}
	}
	Ok(())
}
