use std::fs;
use std::io;
use std::path::Path;

/// Positioned file access shared by every reader of an open table. One
/// handle serves all iterators; reads never move a shared cursor.
pub trait File: Send + Sync + 'static {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
	fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
	fn len(&self) -> io::Result<u64>;
	fn sync_all(&self) -> io::Result<()>;
}

#[cfg(unix)]
impl File for fs::File {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
		use std::os::unix::fs::FileExt;
		self.read_exact_at(buf, offset)
	}

	fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
		use std::os::unix::fs::FileExt;
		self.write_all_at(buf, offset)
	}

	fn len(&self) -> io::Result<u64> {
		Ok(self.metadata()?.len())
	}

	fn sync_all(&self) -> io::Result<()> {
		fs::File::sync_all(self)
	}
}

pub fn open_read_write(path: &Path) -> io::Result<fs::File> {
	fs::OpenOptions::new().read(true).write(true).open(path)
}
