//! Core library for the clustered-filesystem consistency checker: the
//! on-disk format, the checker's shared state, and the fixed pipeline of
//! passes the `fsck.cfs` binary drives.
//!
//! Grounded in `fsck.ocfs2`'s split between `libocfs2`/`libtools-internal`
//! (this crate) and its `fsck.c` driver (`src/bin/fsck.rs`).

pub mod bitmap;
pub mod cluster;
pub mod disk;
pub mod driver;
pub mod error;
pub mod icount;
pub mod journal;
pub mod ondisk;
pub mod pass0;
pub mod pass1;
pub mod pass1b;
pub mod pass1c;
pub mod pass1d;
pub mod pass2;
pub mod pass3;
pub mod pass4;
pub mod pass5;
pub mod prompt;
pub mod refcount;
pub mod signal;
pub mod state;
pub mod util;
