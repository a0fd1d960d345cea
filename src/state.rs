//! `CheckerState`: the process-wide structure the driver owns and every
//! pass reads from and mutates.
//!
//! Grounded in `fsck.ocfs2/include/fsck.h`'s `o2fsck_state` (bitmap fields,
//! `ost_*` counters, option flags). The red-black trees the original keys by
//! `uint64_t` (`dirblocks`, `dir_parents`, `refcount_trees`) become
//! `BTreeMap`s here: an idiomatic substitution, not a re-architecture of
//! behavior.

use crate::bitmap::SparseBitmap;
use crate::icount::IcountMap;
use crate::ondisk::fs::Filesystem;
use crate::prompt::{Prompter, PromptDefault, PromptKind};
use std::collections::BTreeMap;
use std::time::Duration;

/// One directory block registered during Pass 1, consumed by Pass 2.
/// Mirrors `o2fsck_dirblock_entry`'s `e_ino`/`e_blkno`/`e_blkcount`.
#[derive(Clone, Copy, Debug)]
pub struct DirBlockEntry {
	pub ino: u64,
	pub blkcount: u64,
}

/// One directory's connectivity-walk state. Mirrors `o2fsck_dir_parent`'s
/// `dp_dot_dot`/`dp_dirent`/`dp_loop_no`/`dp_connected`.
#[derive(Clone, Copy, Debug)]
pub struct DirParent {
	/// The parent inode recorded in this directory's own ".." entry.
	pub dot_dot: u64,
	/// The inode that has a dirent pointing at this directory (0 if none
	/// observed yet).
	pub dirent_parent: u64,
	pub connected: bool,
	/// Stamped by Pass 3's connectivity walk to detect cycles in O(1).
	pub loop_no: u64,
}

impl DirParent {
	pub fn new(dot_dot: u64) -> Self {
		Self { dot_dot, dirent_parent: 0, connected: false, loop_no: 0 }
	}
}

/// Per-tree state for a reflink refcount tree, populated only when the
/// refcount feature is present. Mirrors the bookkeeping `refcount.c`'s
/// `o2fsck_check_mark_refcounted_clusters` accumulates per root block.
#[derive(Default, Clone, Debug)]
pub struct RefcountTreeState {
	/// Clusters claimed against this tree by inodes walked so far, and the
	/// claimed count for each (used to detect a mismatch against the
	/// tree's own recorded refcounts at reconciliation time).
	pub claimed: BTreeMap<u64, u32>,
}

/// Per-pass resource/throughput counters, printed at the end of a verbose
/// run, grounded in `fsck.ocfs2/include/fsck.h`'s `ost_file_count`/`ost_dir_count`/
/// `ost_links_count`/`ost_orphan_count` and
/// `libtools-internal/progress.c`'s `o2fsck_resource_track`.
#[derive(Default, Debug)]
pub struct PassStats {
	pub file_count: u64,
	pub dir_count: u64,
	pub symlink_count: u64,
	pub orphan_count: u64,
	pub links_count: u64,
	/// Count of extent trees observed at each depth, index 0 = inline-only.
	pub tree_depth_count: [u64; 8],
	pub elapsed: BTreeMap<&'static str, Duration>,
}

impl PassStats {
	pub fn record_tree_depth(&mut self, depth: u16) {
		let idx = (depth as usize).min(self.tree_depth_count.len() - 1);
		self.tree_depth_count[idx] += 1;
	}
}

/// The checker's process-wide state. Invariants exercised directly by the
/// property tests in `tests/scenarios.rs`:
///
/// 1. If inode I is in `used`, an `icount_in_inodes` entry for I exists
///    equal to the link count written in I's on-disk record (or I was
///    fixed up in place).
/// 2. If block B is in `dup_blocks`, B is in `found_blocks` and was
///    observed referenced by >= 2 distinct inodes.
/// 3. If cluster C is in `allocated_clusters`, at least one extent record
///    in some inode's tree has been observed to cover C.
/// 4. For every directory inode D marked in `dir`, exactly one entry
///    exists in `dir_parents` keyed by D.
/// 5. After Pass 3 completes successfully, every directory inode D has
///    `dir_parents[D].connected == true`.
/// 6. After Pass 4 completes successfully, for every inode I in `used`,
///    `icount_in_inodes[I] == icount_refs[I]` and the same value is
///    persisted on disk.
pub struct CheckerState {
	pub fs: Filesystem,

	pub used: SparseBitmap,
	pub bad: SparseBitmap,
	pub dir: SparseBitmap,
	pub regular: SparseBitmap,
	pub rebuild_dirs: SparseBitmap,

	pub found_blocks: SparseBitmap,
	pub dup_blocks: SparseBitmap,

	pub allocated_clusters: SparseBitmap,

	pub icount_in_inodes: IcountMap,
	pub icount_refs: IcountMap,

	pub dirblocks: BTreeMap<u64, DirBlockEntry>,
	pub dir_parents: BTreeMap<u64, DirParent>,
	pub refcount_trees: BTreeMap<u64, RefcountTreeState>,

	/// Per-id (inode count, cluster count) totals accumulated by Pass 1 as it
	/// walks every inode, keyed by `i_uid`/`i_gid`. Consumed by Pass 5 instead
	/// of a second inode scan.
	pub user_usage: BTreeMap<u32, (u64, u64)>,
	pub group_usage: BTreeMap<u32, (u64, u64)>,

	/// Whether the user should be asked at all (`false` forces every
	/// prompt's default answer without reading the terminal).
	pub ask: bool,
	pub default_answer: PromptDefault,
	/// Check and repair even if the dirty bit was clear (`-f`).
	pub force: bool,
	/// Whether writes are actually applied (`false` under `-n`).
	pub write_mode: bool,
	pub verbose: bool,
	/// Set the first time any pass reports a problem, surfaced in the
	/// process exit code.
	pub saw_error: bool,
	/// Set the first time any problem is left uncorrected (prompt refused
	/// or write-mode disabled), also surfaced in the exit code.
	pub uncorrected: bool,

	pub stats: PassStats,
}

impl CheckerState {
	pub fn new(fs: Filesystem, default_answer: PromptDefault, force: bool, write_mode: bool, verbose: bool) -> Self {
		Self {
			fs,
			used: SparseBitmap::new(),
			bad: SparseBitmap::new(),
			dir: SparseBitmap::new(),
			regular: SparseBitmap::new(),
			rebuild_dirs: SparseBitmap::new(),
			found_blocks: SparseBitmap::new(),
			dup_blocks: SparseBitmap::new(),
			allocated_clusters: SparseBitmap::new(),
			icount_in_inodes: IcountMap::new(),
			icount_refs: IcountMap::new(),
			dirblocks: BTreeMap::new(),
			dir_parents: BTreeMap::new(),
			refcount_trees: BTreeMap::new(),
			user_usage: BTreeMap::new(),
			group_usage: BTreeMap::new(),
			ask: !matches!(default_answer, PromptDefault::Yes | PromptDefault::No),
			default_answer,
			force,
			write_mode,
			verbose,
			saw_error: false,
			uncorrected: false,
			stats: PassStats::default(),
		}
	}

	/// Marks a block found by some inode's walk; returns whether the block
	/// had already been found by a previous inode (the caller then also
	/// marks it in `dup_blocks`).
	pub fn mark_found_block(&mut self, blkno: u64) -> bool {
		let was_set = self.found_blocks.set(blkno);
		if was_set {
			self.dup_blocks.set(blkno);
		}
		was_set
	}

	pub fn mark_allocated_cluster(&mut self, cluster: u64) {
		self.allocated_clusters.set(cluster);
	}

	/// Resolves a problem's own inherent bias (`PY`/`PN` in the original's
	/// `problem.h`) against the run's forced mode: a forced `-p`/`-n` run
	/// overrides every problem's bias, but a fully interactive run falls back
	/// to each problem's own default.
	pub fn effective_prompt_default(&self, item_default: PromptDefault) -> PromptDefault {
		match self.default_answer {
			PromptDefault::Ask => item_default,
			forced => forced,
		}
	}

	/// Raises one repair prompt and folds the answer into `saw_error`/
	/// `uncorrected` bookkeeping. Every pass drives its prompts through this
	/// so that bookkeeping can't be forgotten at a call site.
	pub fn confirm(&mut self, prompter: &mut dyn Prompter, item_default: PromptDefault, message: &str) -> bool {
		self.saw_error = true;
		let default = self.effective_prompt_default(item_default);
		let answer = prompter.ask(&PromptKind { default, message });
		if !answer.is_yes() {
			self.uncorrected = true;
		}
		answer.is_yes()
	}
}
