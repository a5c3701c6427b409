use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Default)]
struct Contents {
	data: Vec<u8>,
	finalized: bool,
}

#[derive(Debug, Default)]
struct Shared {
	contents: Mutex<Contents>,
	changed: Condvar,
}

impl Shared {
	fn lock(&self) -> MutexGuard<'_, Contents> {
		self.contents.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn append(&self, bytes: &[u8]) {
		let mut contents = self.lock();
		debug_assert!(!contents.finalized);
		contents.data.extend_from_slice(bytes);
		self.changed.notify_all();
	}

	fn finalize(&self) {
		let mut contents = self.lock();
		contents.finalized = true;
		self.changed.notify_all();
	}
}

/// Output of a stage captured by a dedicated reader thread.
///
/// Clones share the same capture. The reader thread keeps its own share
/// until end-of-stream, so the capture outlives every user handle that is
/// dropped early and is released only after it is finalized.
#[derive(Debug, Clone)]
pub struct ProcessBuffer {
	shared: Arc<Shared>,
}

impl ProcessBuffer {
	/// Starts draining `read_end` in the background.
	pub fn new(read_end: OwnedFd) -> io::Result<ProcessBuffer> {
		let shared = Arc::new(Shared::default());
		let reader_share = Arc::clone(&shared);
		let mut source = File::from(read_end);
		thread::Builder::new()
			.name("ish-buffer".to_string())
			.spawn(move || {
				let mut chunk = [0u8; READ_CHUNK];
				loop {
					match source.read(&mut chunk) {
						Ok(0) => break,
						Ok(n) => reader_share.append(&chunk[..n]),
						Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
						Err(e) => {
							warn!(error = %e, "process buffer read failed");
							break;
						},
					}
				}
				drop(source);
				reader_share.finalize();
				debug!(bytes = reader_share.lock().data.len(), "process buffer finalized");
			})?;
		Ok(ProcessBuffer { shared })
	}

	/// Copy of everything captured so far.
	pub fn snapshot(&self) -> Vec<u8> {
		self.shared.lock().data.clone()
	}

	pub fn is_finalized(&self) -> bool {
		self.shared.lock().finalized
	}

	pub fn len(&self) -> usize {
		self.shared.lock().data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Blocks until the writer side has closed and everything is captured.
	pub fn await_final(&self) {
		let mut contents = self.shared.lock();
		while !contents.finalized {
			contents = self.shared.changed.wait(contents).unwrap_or_else(PoisonError::into_inner);
		}
	}

	/// Streams the capture into `target`, following live appends until the
	/// buffer is finalized.
	pub fn pipe_to<W: Write + ?Sized>(&self, target: &mut W) -> io::Result<()> {
		let mut offset = 0;
		loop {
			let (chunk, done) = {
				let mut contents = self.shared.lock();
				while contents.data.len() == offset && !contents.finalized {
					contents = self.shared.changed.wait(contents).unwrap_or_else(PoisonError::into_inner);
				}
				let chunk = contents.data[offset..].to_vec();
				(chunk, contents.finalized)
			};
			offset += chunk.len();
			if !chunk.is_empty() {
				target.write_all(&chunk)?;
			}
			if done && chunk.is_empty() {
				return target.flush();
			}
		}
	}

	/// Number of live shares, the reader thread's included.
	pub fn share_count(&self) -> usize {
		Arc::strong_count(&self.shared)
	}
}
