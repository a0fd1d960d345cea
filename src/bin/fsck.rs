//! `fsck.cfs`: the CLI driver that opens a device, builds a `CheckerState`,
//! and runs it through `cfsck_core::driver::run`.
//!
//! Argument parsing follows this workspace's `mkfs` binary: a manual loop
//! over `std::env::args_os` populating a plain `Args` struct, rather than
//! an argument-parsing crate — this binary has no dependency on one, just
//! as `mkfs` doesn't. Exit codes follow the original's `fsck.ocfs2` table
//! (mirrored in `cfsck_core::error`).

use cfsck_core::cluster::NullClusterStack;
use cfsck_core::disk::FileBlockDevice;
use cfsck_core::driver::{self, RunOutcome};
use cfsck_core::error::fatal;
use cfsck_core::ondisk::fs::Filesystem;
use cfsck_core::prompt::{PromptDefault, TerminalPrompter};
use cfsck_core::signal;
use cfsck_core::state::CheckerState;
use std::path::PathBuf;
use std::process::exit;

const USAGE: &str = "\
usage: fsck.cfs [-b superblock-blkno] [-B blocksize] [-n | -p] [-f] [-v] [-F] device

  -b <blkno>   read the superblock from this block instead of the default
  -B <size>    assume this blocksize instead of trusting the superblock probe
  -n           non-interactive, assume \"no\" to every repair (read-only)
  -p           non-interactive, assume \"yes\" to every repair (preen)
  -f           check even if the volume looks clean
  -v           verbose: log every block touched by journal replay and the passes
  -F           skip the cluster-membership check (single-node use only)
  -h, --help   print this message
";

#[derive(Default)]
struct Args {
    device: Option<PathBuf>,
    superblock_blkno: u64,
    blocksize: Option<u32>,
    preen: bool,
    read_only: bool,
    force: bool,
    verbose: bool,
    skip_cluster_check: bool,
}

fn parse_args(argv: std::env::ArgsOs) -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = argv.skip(1);
    while let Some(arg) = it.next() {
        let arg = arg.to_string_lossy().into_owned();
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{USAGE}");
                exit(0);
            }
            "-n" => args.read_only = true,
            "-p" => args.preen = true,
            "-f" => args.force = true,
            "-v" => args.verbose = true,
            "-F" => args.skip_cluster_check = true,
            "-b" => {
                let val = it.next().ok_or("-b requires a block number")?;
                args.superblock_blkno = val
                    .to_string_lossy()
                    .parse()
                    .map_err(|_| "-b expects a number".to_string())?;
            }
            "-B" => {
                let val = it.next().ok_or("-B requires a blocksize")?;
                args.blocksize = Some(
                    val.to_string_lossy()
                        .parse()
                        .map_err(|_| "-B expects a number".to_string())?,
                );
            }
            other if other.starts_with('-') && other.len() > 1 => {
                return Err(format!("unrecognized option: {other}"));
            }
            other => {
                if args.device.is_some() {
                    return Err(format!("unexpected extra argument: {other}"));
                }
                args.device = Some(PathBuf::from(other));
            }
        }
    }
    if args.preen && args.read_only {
        return Err("-n and -p are mutually exclusive".to_string());
    }
    Ok(args)
}

fn main() {
    let bin = "fsck.cfs";
    let args = match parse_args(std::env::args_os()) {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("{bin}: {msg}");
            eprint!("{USAGE}");
            exit(16);
        }
    };
    let Some(device) = args.device.clone() else {
        eprintln!("{bin}: no device specified");
        eprint!("{USAGE}");
        exit(16);
    };

    signal::install_handlers();

    let block_size = args.blocksize.unwrap_or(4096);
    let dev = match FileBlockDevice::open(&device, block_size, args.read_only) {
        Ok(dev) => Box::new(dev),
        Err(err) => {
            eprintln!("{bin}: {device:?}: {err}");
            exit(8);
        }
    };

    let fs = match Filesystem::open(dev, args.superblock_blkno) {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!("{bin}: {device:?}: {err}");
            exit(8);
        }
    };

    let default_answer = if args.preen {
        PromptDefault::Yes
    } else if args.read_only {
        PromptDefault::No
    } else {
        PromptDefault::Ask
    };
    let write_mode = !args.read_only;

    let mut state = CheckerState::new(fs, default_answer, args.force, write_mode, args.verbose);
    let mut prompter = TerminalPrompter;
    // No real cluster-stack binding exists in this crate yet (see
    // `cluster.rs`), so `-F` has nothing to skip: `NullClusterStack` always
    // reports unmounted, same as the real binding would on a single node.
    let _ = args.skip_cluster_check;
    let mut null_cluster = NullClusterStack;

    match driver::run(&mut state, &mut prompter, &mut null_cluster) {
        Err(err) => fatal(bin, &err),
        Ok(RunOutcome::MountedElsewhere) => {
            eprintln!("{bin}: {device:?} is mounted on another node; refusing to check");
            exit(8);
        }
        Ok(RunOutcome::Cancelled) => {
            eprintln!("{bin}: cancelled");
            exit(32);
        }
        Ok(RunOutcome::Completed) => {
            let mut code = 0;
            if state.saw_error {
                code |= 1;
            }
            if state.uncorrected {
                code |= 4;
            }
            exit(code);
        }
    }
}
