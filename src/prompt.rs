//! Interactive repair prompting.
//!
//! Mirrors `problem.c`'s `prompt()`/`PY`/`PN` from the original source and
//! this workspace's `utils::prompt::prompt` (raw-terminal single keystroke
//! reads via `libc::termios`). The user-interaction layer is a collaborator
//! trait so the core can be driven by a scripted responder in tests, per
//! the design notes.

use std::io::{self, BufRead, Write};

/// The answer to a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
	Yes,
	No,
}

impl Answer {
	pub fn is_yes(self) -> bool {
		matches!(self, Answer::Yes)
	}
}

/// The default-answer policy for a given prompt, corresponding to the
/// original's `PY`/`PN` flags and this checker's `-p`/`-n` CLI modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDefault {
	/// Default to yes when no answer is forced (`PY` in the original, `-p`
	/// preen mode).
	Yes,
	/// Default to no when no answer is forced (`PN`, `-n` mode).
	No,
	/// No forced default: actually ask the user.
	Ask,
}

/// A single repair prompt: a precise description of the state found and
/// what "yes" would do, plus the default-answer policy that applies.
pub struct PromptKind<'a> {
	pub default: PromptDefault,
	pub message: &'a str,
}

/// The collaborator that turns a [`PromptKind`] into an [`Answer`].
pub trait Prompter {
	fn ask(&mut self, prompt: &PromptKind) -> Answer;
}

/// Interactive prompter: reads a single character from the real terminal.
///
/// An unanswered prompt (EOF on stdin) is treated as "no".
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
	fn ask(&mut self, prompt: &PromptKind) -> Answer {
		match prompt.default {
			PromptDefault::Yes => {
				println!("{} y", prompt.message);
				return Answer::Yes;
			}
			PromptDefault::No => {
				println!("{} n", prompt.message);
				return Answer::No;
			}
			PromptDefault::Ask => {}
		}

		print!("{} (y/n) ", prompt.message);
		let _ = io::stdout().flush();

		match io::stdin().lock().lines().next() {
			Some(Ok(line)) => {
				let line = line.trim().to_lowercase();
				if line == "y" || line == "yes" {
					Answer::Yes
				} else {
					Answer::No
				}
			}
			// EOF or a read error: treated as "no".
			_ => Answer::No,
		}
	}
}

/// A scripted prompter for tests: returns answers from a fixed queue in
/// order, panicking if more prompts are asked than were scripted (so tests
/// fail loudly when a pass's prompting behavior changes unexpectedly).
pub struct ScriptedPrompter {
	answers: std::collections::VecDeque<Answer>,
	/// Every message seen, for assertions in tests.
	pub seen: Vec<String>,
}

impl ScriptedPrompter {
	pub fn new<I: IntoIterator<Item = Answer>>(answers: I) -> Self {
		Self {
			answers: answers.into_iter().collect(),
			seen: Vec::new(),
		}
	}

	/// A prompter that always answers "yes", matching `-p` preen mode.
	pub fn always_yes() -> AlwaysPrompter {
		AlwaysPrompter(Answer::Yes)
	}

	/// A prompter that always answers "no", matching `-n` mode.
	pub fn always_no() -> AlwaysPrompter {
		AlwaysPrompter(Answer::No)
	}
}

impl Prompter for ScriptedPrompter {
	fn ask(&mut self, prompt: &PromptKind) -> Answer {
		self.seen.push(prompt.message.to_owned());
		self.answers.pop_front().unwrap_or_else(|| {
			panic!(
				"scripted prompter ran out of answers at prompt: {}",
				prompt.message
			)
		})
	}
}

/// A prompter that always returns the same answer, regardless of the
/// prompt's own default policy. Used to model `-p` (preen, force-yes) and
/// `-n` (force-no).
pub struct AlwaysPrompter(Answer);

impl Prompter for AlwaysPrompter {
	fn ask(&mut self, _prompt: &PromptKind) -> Answer {
		self.0
	}
}
