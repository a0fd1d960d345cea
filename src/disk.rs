//! Block-device I/O.
//!
//! Ported from `utils::disk::get_disk_size` (the `BLKGETSIZE64` ioctl
//! dance) and generalized into a `BlockDevice` trait so the checker core can
//! run against either a real device file or, in tests, an in-memory image.
//! Scope stops at fixed-size block reads/writes and the directory-iteration
//! pre-fill hint; anything past that belongs to a higher layer.

use libc::ioctl;
use std::ffi::c_long;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

macro_rules! ioc {
	($a:expr, $b:expr, $c:expr, $d:expr) => {
		(($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
	};
}

macro_rules! ior {
	($a:expr, $b:expr, $c:ty) => {
		ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
	};
}

/// ioctl command: get the size of a block device in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Returns the size of the device or regular file at `path`, in bytes.
///
/// See `utils::disk::get_disk_size` in this workspace's sibling CLI tools (which returns a
/// sector count; this returns raw bytes since the checker works in
/// filesystem block units, not fixed 512-byte sectors).
pub fn get_device_size(path: &Path) -> io::Result<u64> {
	let metadata = fs::metadata(path)?;
	let file_type = metadata.file_type();

	if file_type.is_block_device() || file_type.is_char_device() {
		let dev = File::open(path)?;
		let mut size: u64 = 0;
		let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
		if ret < 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(size)
	} else {
		Ok(metadata.len())
	}
}

/// A coalesced read-ahead hint: when directory iteration is about to visit a
/// run of consecutive blocks, it issues one pre-fill read instead of many
/// small ones. Capped at 1 MiB.
pub const PREFETCH_CAP_BYTES: u64 = 1024 * 1024;

/// Fixed-size block I/O, addressed by block number (not byte offset).
pub trait BlockDevice {
	fn block_size(&self) -> u32;
	fn block_count(&self) -> u64;

	/// Reads `count` consecutive blocks starting at `blkno` into `buf`.
	/// `buf` must be at least `count * block_size()` bytes.
	fn read_blocks(&mut self, blkno: u64, count: u32, buf: &mut [u8]) -> io::Result<()>;

	/// Writes `count` consecutive blocks starting at `blkno` from `buf`.
	fn write_blocks(&mut self, blkno: u64, count: u32, buf: &[u8]) -> io::Result<()>;

	/// Hints that blocks `[blkno, blkno+count)` are about to be read
	/// sequentially; implementations may use this to prime a cache with
	/// coalesced reads of up to [`PREFETCH_CAP_BYTES`]. The default
	/// implementation does nothing: prefetching is an optimization, never a
	/// correctness requirement.
	fn prefetch(&mut self, _blkno: u64, _count: u32) {}

	/// Ensures every write issued so far is durable before the caller
	/// proceeds — used at pass boundaries so an interruption never leaves
	/// the filesystem in a state that mixes this pass's writes with a
	/// future one's.
	fn flush(&mut self) -> io::Result<()>;

	/// A single block read, convenience wrapper over [`BlockDevice::read_blocks`].
	fn read_block(&mut self, blkno: u64, buf: &mut [u8]) -> io::Result<()> {
		self.read_blocks(blkno, 1, buf)
	}

	/// A single block write, convenience wrapper over [`BlockDevice::write_blocks`].
	fn write_block(&mut self, blkno: u64, buf: &[u8]) -> io::Result<()> {
		self.write_blocks(blkno, 1, buf)
	}
}

/// A `BlockDevice` backed by a real file or block-special device.
pub struct FileBlockDevice {
	file: File,
	block_size: u32,
	block_count: u64,
}

impl FileBlockDevice {
	/// Opens `path` read-write and reports `block_count` blocks of
	/// `block_size` bytes, clamped to the device's actual byte size.
	pub fn open(path: &Path, block_size: u32, read_only: bool) -> io::Result<Self> {
		let file = fs::OpenOptions::new()
			.read(true)
			.write(!read_only)
			.open(path)?;
		let byte_size = get_device_size(path)?;
		let block_count = byte_size / block_size as u64;
		Ok(Self {
			file,
			block_size,
			block_count,
		})
	}
}

impl BlockDevice for FileBlockDevice {
	fn block_size(&self) -> u32 {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn read_blocks(&mut self, blkno: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
		let off = blkno * self.block_size as u64;
		self.file.seek(SeekFrom::Start(off))?;
		self.file
			.read_exact(&mut buf[..count as usize * self.block_size as usize])
	}

	fn write_blocks(&mut self, blkno: u64, count: u32, buf: &[u8]) -> io::Result<()> {
		let off = blkno * self.block_size as u64;
		self.file.seek(SeekFrom::Start(off))?;
		self.file
			.write_all(&buf[..count as usize * self.block_size as usize])
	}

	fn flush(&mut self) -> io::Result<()> {
		self.file.sync_data()
	}
}

/// An in-memory `BlockDevice` over a flat byte buffer, used by unit and
/// scenario tests that need a filesystem image without a real device.
pub struct MemBlockDevice {
	pub data: Vec<u8>,
	block_size: u32,
}

impl MemBlockDevice {
	pub fn new(block_size: u32, block_count: u64) -> Self {
		Self {
			data: vec![0u8; block_size as usize * block_count as usize],
			block_size,
		}
	}
}

impl BlockDevice for MemBlockDevice {
	fn block_size(&self) -> u32 {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		self.data.len() as u64 / self.block_size as u64
	}

	fn read_blocks(&mut self, blkno: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
		let start = blkno as usize * self.block_size as usize;
		let len = count as usize * self.block_size as usize;
		if start + len > self.data.len() {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "block out of range"));
		}
		buf[..len].copy_from_slice(&self.data[start..start + len]);
		Ok(())
	}

	fn write_blocks(&mut self, blkno: u64, count: u32, buf: &[u8]) -> io::Result<()> {
		let start = blkno as usize * self.block_size as usize;
		let len = count as usize * self.block_size as usize;
		if start + len > self.data.len() {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "block out of range"));
		}
		self.data[start..start + len].copy_from_slice(&buf[..len]);
		Ok(())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}
