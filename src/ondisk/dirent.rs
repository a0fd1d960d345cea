//! Directory entries.
//!
//! Grounded in `fsck.ocfs2/pass2.c`'s `fix_dirent_lengths`/`fix_dirent_dots`
//! (which this crate's `pass2.rs` reimplements) and the layout implied by
//! `ocfs2_dir_entry` throughout `fsck.ocfs2/dirblocks.c`: a variable-length
//! record of `(inode, rec_len, name_len, file_type, name)`.

use std::io;

pub const DIR_ENTRY_HEADER_LEN: usize = 8;
pub const MAX_NAME_LEN: usize = 255;

pub const FILE_TYPE_UNKNOWN: u8 = 0;
pub const FILE_TYPE_REGULAR: u8 = 1;
pub const FILE_TYPE_DIR: u8 = 2;

/// A directory entry decoded from a raw directory block. `rec_len` is the
/// entry's on-disk span including padding; `name` is exactly `name_len`
/// bytes with no embedded nul.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
	pub inode: u64,
	pub rec_len: u16,
	pub name_len: u8,
	pub file_type: u8,
	pub name: Vec<u8>,
}

impl DirEntry {
	/// Minimum `rec_len` for an entry with no name (a bare, deletable
	/// header): inode(8) + rec_len(2) + name_len(1) + file_type(1).
	pub const MIN_REC_LEN: u16 = DIR_ENTRY_HEADER_LEN as u16 + 4;

	/// `OCFS2_DIR_REC_LEN`: the minimum span a name of `name_len` bytes
	/// needs, rounded up to a 4-byte boundary.
	pub fn rec_len_for_name(name_len: u8) -> u16 {
		let raw = DIR_ENTRY_HEADER_LEN + 4 + name_len as usize;
		((raw + 3) & !3) as u16
	}

	pub fn is_deleted(&self) -> bool {
		self.inode == 0
	}

	pub fn is_dot(&self) -> bool {
		self.name == b"."
	}

	pub fn is_dotdot(&self) -> bool {
		self.name == b".."
	}

	/// Decodes one entry starting at `buf[0]`. Returns `(entry, consumed)`
	/// where `consumed == rec_len` as read from the wire, NOT validated —
	/// callers run `fix_dirent_lengths`-equivalent repair before trusting
	/// it to advance a cursor.
	pub fn decode(buf: &[u8]) -> io::Result<(Self, usize)> {
		if buf.len() < DIR_ENTRY_HEADER_LEN + 4 {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short dirent"));
		}
		let inode = u64::from_le_bytes(buf[0..8].try_into().unwrap());
		let rec_len = u16::from_le_bytes(buf[8..10].try_into().unwrap());
		let name_len = buf[10];
		let file_type = buf[11];
		let name_end = 12 + name_len as usize;
		if name_end > buf.len() {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "dirent name overruns buffer"));
		}
		let name = buf[12..name_end].to_vec();
		Ok((
			DirEntry { inode, rec_len, name_len, file_type, name },
			rec_len as usize,
		))
	}

	pub fn encode_into(&self, buf: &mut [u8]) {
		buf[0..8].copy_from_slice(&self.inode.to_le_bytes());
		buf[8..10].copy_from_slice(&self.rec_len.to_le_bytes());
		buf[10] = self.name_len;
		buf[11] = self.file_type;
		buf[12..12 + self.name.len()].copy_from_slice(&self.name);
	}
}

/// Iterates the raw entries of one directory block without repairing
/// anything; `pass2::fix_dirent_lengths` drives a mutable walk separately
/// since repair must see and rewrite raw bytes in place.
pub fn iter_dir_block(buf: &[u8]) -> impl Iterator<Item = (usize, io::Result<DirEntry>)> + '_ {
	let mut offset = 0usize;
	std::iter::from_fn(move || {
		if offset >= buf.len() {
			return None;
		}
		let start = offset;
		match DirEntry::decode(&buf[offset..]) {
			Ok((entry, consumed)) => {
				offset += consumed.max(1);
				Some((start, Ok(entry)))
			}
			Err(e) => {
				offset = buf.len();
				Some((start, Err(e)))
			}
		}
	})
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn rec_len_for_name_rounds_up_to_four() {
		assert_eq!(DirEntry::rec_len_for_name(1), 16);
		assert_eq!(DirEntry::rec_len_for_name(5), 20);
		assert_eq!(DirEntry::rec_len_for_name(4), 16);
	}

	#[test]
	fn encode_decode_round_trip() {
		let entry = DirEntry {
			inode: 99,
			rec_len: 16,
			name_len: 3,
			file_type: FILE_TYPE_REGULAR,
			name: b"abc".to_vec(),
		};
		let mut buf = vec![0u8; 16];
		entry.encode_into(&mut buf);
		let (back, consumed) = DirEntry::decode(&buf).unwrap();
		assert_eq!(consumed, 16);
		assert_eq!(back, entry);
	}

	#[test]
	fn iter_dir_block_walks_two_entries() {
		let mut buf = vec![0u8; 32];
		let dot = DirEntry { inode: 5, rec_len: 16, name_len: 1, file_type: FILE_TYPE_DIR, name: b".".to_vec() };
		let dotdot = DirEntry { inode: 2, rec_len: 16, name_len: 2, file_type: FILE_TYPE_DIR, name: b"..".to_vec() };
		dot.encode_into(&mut buf[0..16]);
		dotdot.encode_into(&mut buf[16..32]);

		let entries: Vec<DirEntry> = iter_dir_block(&buf).map(|(_, r)| r.unwrap()).collect();
		assert_eq!(entries.len(), 2);
		assert!(entries[0].is_dot());
		assert!(entries[1].is_dotdot());
	}
}
