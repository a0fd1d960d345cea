//! The fixed pipeline: journal replay, then every pass in order, threading
//! one `CheckerState` through all of them.
//!
//! Grounded in `original_source/fsck.ocfs2/fsck.c`'s `main` (the original's
//! own pass sequencing, cluster-membership check, and "log and keep going"
//! policy for anything but a handful of unconditionally fatal errors).

use crate::cluster::ClusterStack;
use crate::error::{CheckError, CheckResult};
use crate::journal::Journal;
use crate::prompt::Prompter;
use crate::state::CheckerState;
use crate::{pass0, pass1, pass1b, pass1c, pass1d, pass2, pass3, pass4, pass5, refcount, signal};

/// Run the volume is mounted elsewhere, cancelled, or had an internal
/// failure — for every other outcome, see [`CheckerState::saw_error`] /
/// [`CheckerState::uncorrected`] for what the caller should report.
#[derive(Debug)]
pub enum RunOutcome {
	/// Every pass ran to completion (individual passes may still have left
	/// `saw_error`/`uncorrected` set on `state`).
	Completed,
	/// The cluster stack reports the volume mounted elsewhere; nothing was
	/// touched.
	MountedElsewhere,
	/// A signal arrived, or a pass was cancelled outright (e.g. Pass 3's
	/// missing-root check): the run stopped early.
	Cancelled,
}

/// Runs journal replay followed by every pass in the fixed order
/// Pass 0 → Pass 1 → refcount reconcile → (Pass 1b–1d) → Pass 2 → Pass 3 →
/// Pass 4 → Pass 5, checking for a cancellation signal between each step.
///
/// Pass 0 failure is unconditionally fatal to the whole run (its own doc
/// comment: later passes assume the allocators it scans are internally
/// consistent). Every other pass follows the general propagation policy:
/// an error whose [`CheckError::is_fatal`] is true aborts the run, anything
/// else is logged and the driver moves on to the next pass. Pass 3's
/// internal root-missing check raises `CheckError::Cancelled`, which
/// `is_fatal()` does not cover (user cancellation is not an internal bug) —
/// the driver treats it as run-ending anyway by checking for it explicitly,
/// since there is nothing left pass 3 onward could usefully check without a
/// root.
pub fn run(state: &mut CheckerState, prompter: &mut dyn Prompter, cluster: &mut dyn ClusterStack) -> CheckResult<RunOutcome> {
	if cluster.is_mounted_elsewhere() {
		return Ok(RunOutcome::MountedElsewhere);
	}

	if Journal::should_replay(&mut state.fs)? || state.force {
		crate::verbosef!(state, "replaying journal(s)");
		Journal::replay_all(state)?;
		state.fs.flush()?;
	}
	if signal::was_cancelled() {
		return Ok(RunOutcome::Cancelled);
	}

	if let Err(err) = pass0::run(state, prompter) {
		return Err(err);
	}
	state.fs.flush()?;
	if signal::was_cancelled() {
		return Ok(RunOutcome::Cancelled);
	}

	run_step(state, |state| pass1::run(state, prompter))?;
	run_step(state, |state| refcount::reconcile(state, prompter))?;

	if !state.dup_blocks.is_empty() {
		let ctx = match pass1b::run(state) {
			Ok(ctx) => Some(ctx),
			Err(err) if err.is_fatal() => return Err(err),
			Err(err) => {
				log_and_continue(state, &err);
				None
			}
		};
		if let Some(mut ctx) = ctx {
			pass1c::run(state, &mut ctx);
			if signal::was_cancelled() {
				return Ok(RunOutcome::Cancelled);
			}
			run_step(state, |state| pass1d::run(state, prompter, ctx))?;
		}
	}
	if signal::was_cancelled() {
		return Ok(RunOutcome::Cancelled);
	}

	run_step(state, |state| pass2::run(state, prompter))?;
	if signal::was_cancelled() {
		return Ok(RunOutcome::Cancelled);
	}

	match pass3::run(state, prompter) {
		Ok(()) => {}
		Err(CheckError::Cancelled) => return Ok(RunOutcome::Cancelled),
		Err(err) if err.is_fatal() => return Err(err),
		Err(err) => log_and_continue(state, &err),
	}
	if signal::was_cancelled() {
		return Ok(RunOutcome::Cancelled);
	}

	run_step(state, |state| pass4::run(state, prompter))?;
	if signal::was_cancelled() {
		return Ok(RunOutcome::Cancelled);
	}

	run_step(state, |state| pass5::run(state, prompter))?;
	state.fs.flush()?;

	Ok(RunOutcome::Completed)
}

/// Runs one pass under the general (non-Pass-0) propagation policy: a fatal
/// error aborts the whole run, anything else is logged on `state` and
/// swallowed so the pipeline keeps going, matching spec's "this is
/// intentional" note on partial-failure propagation.
fn run_step<F>(state: &mut CheckerState, step: F) -> CheckResult<()>
where
	F: FnOnce(&mut CheckerState) -> CheckResult<()>,
{
	match step(state) {
		Ok(()) => {
			state.fs.flush()?;
			Ok(())
		}
		Err(err) if err.is_fatal() => Err(err),
		Err(err) => {
			log_and_continue(state, &err);
			Ok(())
		}
	}
}

fn log_and_continue(state: &mut CheckerState, err: &CheckError) {
	state.saw_error = true;
	eprintln!("warning: {err}");
}
