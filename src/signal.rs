//! Signal handling.
//!
//! `fsck.ocfs2/problem.c`'s `read_a_char` installs a `SIGINT` handler around
//! every prompt so a user who gives up mid-answer gets a clean cancellation
//! instead of a half-read line; this module generalizes that to the five
//! signals a checker run needs to unwind cleanly from
//! (`SIGINT`/`SIGTERM`/`SIGQUIT`/`SIGHUP`/`SIGSEGV`). It uses the same raw
//! `libc::sigaction` style this workspace's `utils::prompt::prompt` reaches
//! for in its termios code rather than pulling in a signal-handling crate
//! for five flag writes.

use libc::{c_int, sigaction, sighandler_t, SA_RESTART, SIGHUP, SIGINT, SIGQUIT, SIGSEGV, SIGTERM};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set by the signal handler for `SIGINT`/`SIGTERM`/`SIGHUP`; passes are
/// expected to poll this between blocks and unwind to a clean exit rather
/// than checking it only at prompts.
pub static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Returns whether a cancellation signal has been received since startup
/// (or since the last [`clear_cancelled`]).
pub fn was_cancelled() -> bool {
	CANCELLED.load(Ordering::SeqCst)
}

/// Resets the cancellation flag. Used by tests that install the handlers
/// more than once within a single process.
pub fn clear_cancelled() {
	CANCELLED.store(false, Ordering::SeqCst);
}

extern "C" fn handle_cancel(_signum: c_int) {
	CANCELLED.store(true, Ordering::SeqCst);
}

/// `SIGQUIT` is left at its default disposition deliberately: a user who
/// sends it wants a core dump for debugging, not a graceful cancellation.
///
/// `SIGSEGV` is reset to default too, rather than caught: catching it would
/// risk running further allocator or I/O code from a handler with a
/// possibly-corrupt stack. It's listed here only so callers can see the
/// full set of signals this crate installs handlers for in one place.
pub fn install_handlers() {
	unsafe {
		let mut act: sigaction = MaybeUninit::zeroed().assume_init();
		act.sa_sigaction = handle_cancel as sighandler_t;
		act.sa_flags = SA_RESTART;
		libc::sigemptyset(&mut act.sa_mask);

		for signum in [SIGINT, SIGTERM, SIGHUP] {
			sigaction(signum, &act, std::ptr::null_mut());
		}

		// Restore default disposition explicitly in case a parent process
		// left either signal blocked or ignored.
		let mut default_act: sigaction = MaybeUninit::zeroed().assume_init();
		default_act.sa_sigaction = libc::SIG_DFL;
		libc::sigemptyset(&mut default_act.sa_mask);
		for signum in [SIGQUIT, SIGSEGV] {
			sigaction(signum, &default_act, std::ptr::null_mut());
		}
	}
}
