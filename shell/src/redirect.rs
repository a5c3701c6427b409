use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::thread;

use tracing::{debug, warn};

use crate::buffer::ProcessBuffer;
use crate::error::RedirectionError;
use crate::plan::create_pipe;
use crate::types::{StderrTarget, StdinTarget, StdoutTarget};

const NULL_DEVICE: &str = "/dev/null";

/// One standard stream as seen by a stage.
#[derive(Debug)]
pub enum Handle {
	/// The shell process's own descriptor.
	Process,
	File(File),
}

impl Handle {
	pub fn try_clone(&self) -> io::Result<Handle> {
		match *self {
			Handle::Process => Ok(Handle::Process),
			Handle::File(ref f) => f.try_clone().map(Handle::File),
		}
	}

	/// A duplicate suitable for handing to a child process.
	pub fn to_stdio(&self) -> io::Result<Stdio> {
		match *self {
			Handle::Process => Ok(Stdio::inherit()),
			Handle::File(ref f) => f.try_clone().map(Stdio::from),
		}
	}

	/// A file duplicating this handle. `Process` resolves to the shell's
	/// own `process_fd`, which must be one of the standard descriptors.
	fn duplicate_file(&self, process_fd: RawFd) -> io::Result<File> {
		match *self {
			Handle::Process => {
				// SAFETY: standard descriptors stay open for the life of the process.
				let fd = unsafe { BorrowedFd::borrow_raw(process_fd) };
				fd.try_clone_to_owned().map(File::from)
			},
			Handle::File(ref f) => f.try_clone(),
		}
	}

	fn raw_fd(&self, process_fd: RawFd) -> RawFd {
		match *self {
			Handle::Process => process_fd,
			Handle::File(ref f) => f.as_raw_fd(),
		}
	}
}

pub enum HandleReader<'a> {
	Stdin(io::Stdin),
	File(&'a File),
}

impl<'a> Read for HandleReader<'a> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match *self {
			HandleReader::Stdin(ref mut s) => s.read(buf),
			HandleReader::File(ref mut f) => f.read(buf),
		}
	}
}

pub enum HandleWriter<'a> {
	Stdout(io::Stdout),
	Stderr(io::Stderr),
	File(&'a File),
}

impl<'a> Write for HandleWriter<'a> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match *self {
			HandleWriter::Stdout(ref mut s) => s.write(buf),
			HandleWriter::Stderr(ref mut s) => s.write(buf),
			HandleWriter::File(ref mut f) => f.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match *self {
			HandleWriter::Stdout(ref mut s) => s.flush(),
			HandleWriter::Stderr(ref mut s) => s.flush(),
			HandleWriter::File(ref mut f) => f.flush(),
		}
	}
}

/// The three standard streams builtins read and write through.
#[derive(Debug)]
pub struct StdHandles {
	pub stdin: Handle,
	pub stdout: Handle,
	pub stderr: Handle,
}

impl Default for StdHandles {
	fn default() -> StdHandles {
		StdHandles::process()
	}
}

impl StdHandles {
	pub fn process() -> StdHandles {
		StdHandles { stdin: Handle::Process, stdout: Handle::Process, stderr: Handle::Process }
	}

	pub fn stdin(&self) -> HandleReader<'_> {
		match self.stdin {
			Handle::Process => HandleReader::Stdin(io::stdin()),
			Handle::File(ref f) => HandleReader::File(f),
		}
	}

	pub fn stdout(&self) -> HandleWriter<'_> {
		match self.stdout {
			Handle::Process => HandleWriter::Stdout(io::stdout()),
			Handle::File(ref f) => HandleWriter::File(f),
		}
	}

	pub fn stderr(&self) -> HandleWriter<'_> {
		match self.stderr {
			Handle::Process => HandleWriter::Stderr(io::stderr()),
			Handle::File(ref f) => HandleWriter::File(f),
		}
	}

	/// Descriptors currently backing stdin, stdout and stderr.
	pub fn raw_fds(&self) -> [RawFd; 3] {
		[
			self.stdin.raw_fd(libc::STDIN_FILENO),
			self.stdout.raw_fd(libc::STDOUT_FILENO),
			self.stderr.raw_fd(libc::STDERR_FILENO),
		]
	}
}

/// Captured output of a builtin that feeds a pipe, forwarded once the
/// builtin has returned and its consumer is running.
#[derive(Debug)]
pub struct Relay {
	buffer: ProcessBuffer,
	target: File,
}

impl Relay {
	pub fn start(self) -> io::Result<thread::JoinHandle<()>> {
		let Relay { buffer, mut target } = self;
		thread::Builder::new().name("ish-relay".to_string()).spawn(move || {
			if let Err(e) = buffer.pipe_to(&mut target) {
				debug!(error = %e, "relay target closed early");
			}
		})
	}
}

/// Concrete handles for one stage.
#[derive(Debug)]
pub struct StageHandles {
	pub handles: StdHandles,
	/// Which of stdin, stdout, stderr differ from the ambient handles.
	pub redirected: [bool; 3],
	pub stdout_buffer: Option<ProcessBuffer>,
	pub stderr_buffer: Option<ProcessBuffer>,
	pub relay: Option<Relay>,
}

fn open(path: &Path, cwd: &Path, options: &OpenOptions) -> Result<File, RedirectionError> {
	let full = cwd.join(path);
	options.open(&full).map_err(|source| RedirectionError::Open { path: full, source })
}

fn open_null(write: bool) -> Result<File, RedirectionError> {
	let mut options = OpenOptions::new();
	if write { options.write(true); } else { options.read(true); }
	open(Path::new(NULL_DEVICE), Path::new("/"), &options)
}

fn overwrite_options() -> OpenOptions {
	let mut options = OpenOptions::new();
	options.write(true).create(true).truncate(true);
	options
}

fn append_options() -> OpenOptions {
	let mut options = OpenOptions::new();
	options.append(true).create(true);
	options
}

fn inherit(ambient: &Handle) -> Result<Handle, RedirectionError> {
	ambient.try_clone().map_err(RedirectionError::Duplicate)
}

fn buffer_pipe() -> Result<(File, ProcessBuffer), RedirectionError> {
	let (read, write) = create_pipe()?;
	let buffer = ProcessBuffer::new(read).map_err(RedirectionError::Duplicate)?;
	Ok((File::from(write), buffer))
}

/// Opens every target of a stage.
///
/// `Inherit` duplicates the ambient handle. With `relay_stdout`, a pipe
/// target is swapped for a relay so an in-process writer never blocks on a
/// reader that has not started yet. On error everything opened so far is
/// closed again.
pub fn resolve(stdin: StdinTarget, stdout: StdoutTarget, stderr: StderrTarget, ambient: &StdHandles, cwd: &Path, relay_stdout: bool) -> Result<StageHandles, RedirectionError> {
	let mut redirected = [true; 3];

	let stdin = match stdin {
		StdinTarget::Inherit => { redirected[0] = false; inherit(&ambient.stdin)? },
		StdinTarget::File(path) => Handle::File(open(&path, cwd, OpenOptions::new().read(true))?),
		StdinTarget::Null => Handle::File(open_null(false)?),
		StdinTarget::Pipe(fd) => Handle::File(File::from(fd)),
	};

	let mut stdout_buffer = None;
	let mut relay = None;
	let stdout = match stdout {
		StdoutTarget::Inherit => { redirected[1] = false; inherit(&ambient.stdout)? },
		StdoutTarget::Overwrite(path) => Handle::File(open(&path, cwd, &overwrite_options())?),
		StdoutTarget::Append(path) => Handle::File(open(&path, cwd, &append_options())?),
		StdoutTarget::Null => Handle::File(open_null(true)?),
		StdoutTarget::Pipe(fd) if relay_stdout => {
			let (write, buffer) = buffer_pipe()?;
			relay = Some(Relay { buffer, target: File::from(fd) });
			Handle::File(write)
		},
		StdoutTarget::Pipe(fd) => Handle::File(File::from(fd)),
		StdoutTarget::Buffer => {
			let (write, buffer) = buffer_pipe()?;
			stdout_buffer = Some(buffer);
			Handle::File(write)
		},
	};

	let mut stderr_buffer = None;
	let stderr = match stderr {
		StderrTarget::Inherit => { redirected[2] = false; inherit(&ambient.stderr)? },
		StderrTarget::Overwrite(path) => Handle::File(open(&path, cwd, &overwrite_options())?),
		StderrTarget::Append(path) => Handle::File(open(&path, cwd, &append_options())?),
		StderrTarget::Null => Handle::File(open_null(true)?),
		StderrTarget::Buffer => {
			let (write, buffer) = buffer_pipe()?;
			stderr_buffer = Some(buffer);
			Handle::File(write)
		},
		StderrTarget::SameAsStdout => Handle::File(stdout.duplicate_file(libc::STDOUT_FILENO).map_err(RedirectionError::Duplicate)?),
	};

	Ok(StageHandles {
		handles: StdHandles { stdin, stdout, stderr },
		redirected,
		stdout_buffer,
		stderr_buffer,
		relay,
	})
}

/// Ambient handles displaced by `apply`, to be put back by `revert`.
#[derive(Debug)]
#[must_use = "a snapshot must be reverted"]
pub struct RedirectSnapshot {
	saved_input: Option<Handle>,
	saved_output: Option<Handle>,
	saved_error: Option<Handle>,
}

impl RedirectSnapshot {
	/// Installs the redirected streams of `stage` as the ambient handles.
	pub fn apply(ambient: &mut StdHandles, stage: StdHandles, redirected: [bool; 3]) -> RedirectSnapshot {
		let StdHandles { stdin, stdout, stderr } = stage;
		let swap = |slot: &mut Handle, replacement: Handle, changed: bool| {
			if changed { Some(std::mem::replace(slot, replacement)) } else { None }
		};
		RedirectSnapshot {
			saved_input: swap(&mut ambient.stdin, stdin, redirected[0]),
			saved_output: swap(&mut ambient.stdout, stdout, redirected[1]),
			saved_error: swap(&mut ambient.stderr, stderr, redirected[2]),
		}
	}

	pub fn resets(&self) -> [bool; 3] {
		[self.saved_input.is_some(), self.saved_output.is_some(), self.saved_error.is_some()]
	}

	/// Puts the saved handles back, closing the ones the stage used.
	pub fn revert(self, ambient: &mut StdHandles) {
		if let Some(h) = self.saved_input {
			ambient.stdin = h;
		}
		if let Some(h) = self.saved_output {
			if let Err(e) = ambient.stdout().flush() {
				warn!(error = %e, "flushing redirected stdout failed");
			}
			ambient.stdout = h;
		}
		if let Some(h) = self.saved_error {
			ambient.stderr = h;
		}
	}
}

/// Anything that owns a set of ambient handles.
pub trait Ambient {
	fn ambient_mut(&mut self) -> &mut StdHandles;
}

impl Ambient for StdHandles {
	fn ambient_mut(&mut self) -> &mut StdHandles {
		self
	}
}

/// Scope guard: the owner runs with the stage's handles installed until the
/// guard is dropped, on every exit path.
pub struct Redirected<'a, T: Ambient> {
	owner: &'a mut T,
	snapshot: Option<RedirectSnapshot>,
}

impl<'a, T: Ambient> Redirected<'a, T> {
	pub fn apply(owner: &'a mut T, stage: StdHandles, redirected: [bool; 3]) -> Redirected<'a, T> {
		let snapshot = RedirectSnapshot::apply(owner.ambient_mut(), stage, redirected);
		Redirected { owner, snapshot: Some(snapshot) }
	}
}

impl<'a, T: Ambient> Deref for Redirected<'a, T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.owner
	}
}

impl<'a, T: Ambient> DerefMut for Redirected<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		self.owner
	}
}

impl<'a, T: Ambient> Drop for Redirected<'a, T> {
	fn drop(&mut self) {
		if let Some(snapshot) = self.snapshot.take() {
			snapshot.revert(self.owner.ambient_mut());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::fs;
	use std::os::fd::OwnedFd;
	use std::panic::{self, AssertUnwindSafe};
	use std::path::PathBuf;

	fn file_handles(dir: &Path) -> StdHandles {
		let open = |name: &str| Handle::File(File::create(dir.join(name)).unwrap());
		StdHandles { stdin: open("in"), stdout: open("out"), stderr: open("err") }
	}

	#[test]
	fn resolve_opens_overwrite_and_append() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("log"), "old\n").unwrap();
		let ambient = StdHandles::process();
		let stage = resolve(
			StdinTarget::Inherit,
			StdoutTarget::Overwrite(PathBuf::from("out")),
			StderrTarget::Append(PathBuf::from("log")),
			&ambient,
			dir.path(),
			false,
		).unwrap();
		assert_eq!(stage.redirected, [false, true, true]);
		let StdHandles { stdout, stderr, .. } = stage.handles;
		if let (Handle::File(mut out), Handle::File(mut err)) = (stdout, stderr) {
			out.write_all(b"new\n").unwrap();
			err.write_all(b"more\n").unwrap();
		} else {
			panic!("expected files");
		}
		assert_eq!(fs::read_to_string(dir.path().join("out")).unwrap(), "new\n");
		assert_eq!(fs::read_to_string(dir.path().join("log")).unwrap(), "old\nmore\n");
	}

	#[test]
	fn missing_input_file_is_a_redirection_error() {
		let dir = tempfile::tempdir().unwrap();
		let err = resolve(
			StdinTarget::File(PathBuf::from("absent")),
			StdoutTarget::Inherit,
			StderrTarget::Inherit,
			&StdHandles::process(),
			dir.path(),
			false,
		).unwrap_err();
		assert!(matches!(err, RedirectionError::Open { ref path, .. } if path == &dir.path().join("absent")));
	}

	#[test]
	fn failed_resolve_closes_adopted_pipe_ends() {
		let dir = tempfile::tempdir().unwrap();
		let (read, write) = create_pipe().unwrap();
		let _ = resolve(
			StdinTarget::Pipe(read),
			StdoutTarget::Overwrite(dir.path().join("no/such/dir/out")),
			StderrTarget::Inherit,
			&StdHandles::process(),
			dir.path(),
			false,
		).unwrap_err();
		// With the read end gone, writing reports a broken pipe.
		let mut writer = File::from(write);
		let err = writer.write_all(b"x").unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
	}

	#[test]
	fn stderr_can_follow_stdout() {
		let dir = tempfile::tempdir().unwrap();
		let stage = resolve(
			StdinTarget::Null,
			StdoutTarget::Overwrite(PathBuf::from("both")),
			StderrTarget::SameAsStdout,
			&StdHandles::process(),
			dir.path(),
			false,
		).unwrap();
		assert_eq!(stage.redirected, [true, true, true]);
		stage.handles.stdout().write_all(b"out ").unwrap();
		stage.handles.stderr().write_all(b"err").unwrap();
		drop(stage);
		assert_eq!(fs::read_to_string(dir.path().join("both")).unwrap(), "out err");
	}

	#[test]
	fn stderr_follows_the_process_stdout() {
		use std::os::unix::fs::MetadataExt;

		let stage = resolve(
			StdinTarget::Inherit,
			StdoutTarget::Inherit,
			StderrTarget::SameAsStdout,
			&StdHandles::process(),
			Path::new("/"),
			false,
		).unwrap();
		assert_eq!(stage.redirected, [false, false, true]);
		let joined = match stage.handles.stderr {
			Handle::File(ref f) => f.metadata().unwrap(),
			Handle::Process => panic!("stderr still names the process stderr"),
		};
		let stdout = Handle::Process.duplicate_file(libc::STDOUT_FILENO).unwrap().metadata().unwrap();
		assert_eq!((joined.dev(), joined.ino()), (stdout.dev(), stdout.ino()));
		assert!(stage.handles.raw_fds()[2] != libc::STDERR_FILENO);
	}

	#[test]
	fn stderr_follows_an_inherited_file_stdout() {
		let dir = tempfile::tempdir().unwrap();
		let ambient = file_handles(dir.path());
		let stage = resolve(
			StdinTarget::Inherit,
			StdoutTarget::Inherit,
			StderrTarget::SameAsStdout,
			&ambient,
			dir.path(),
			false,
		).unwrap();
		assert_eq!(stage.redirected, [false, false, true]);
		stage.handles.stderr().write_all(b"joined").unwrap();
		drop(stage);
		assert_eq!(fs::read_to_string(dir.path().join("out")).unwrap(), "joined");
		assert_eq!(fs::read_to_string(dir.path().join("err")).unwrap(), "");
	}

	#[test]
	fn buffer_targets_capture_writes() {
		let stage = resolve(
			StdinTarget::Inherit,
			StdoutTarget::Buffer,
			StderrTarget::Inherit,
			&StdHandles::process(),
			Path::new("/"),
			false,
		).unwrap();
		let buffer = stage.stdout_buffer.clone().unwrap();
		stage.handles.stdout().write_all(b"kept").unwrap();
		drop(stage);
		buffer.await_final();
		assert_eq!(buffer.snapshot(), b"kept".to_vec());
	}

	#[test]
	fn relay_forwards_after_writer_closes() {
		let (read, write): (OwnedFd, OwnedFd) = create_pipe().unwrap();
		let mut stage = resolve(
			StdinTarget::Inherit,
			StdoutTarget::Pipe(write),
			StderrTarget::Inherit,
			&StdHandles::process(),
			Path::new("/"),
			true,
		).unwrap();
		let relay = stage.relay.take().unwrap();
		// Far more than a pipe holds; must not block without a reader.
		let payload = vec![b'z'; 256 * 1024];
		stage.handles.stdout().write_all(&payload).unwrap();
		drop(stage);
		let forwarder = relay.start().unwrap();
		let mut received = Vec::new();
		File::from(read).read_to_end(&mut received).unwrap();
		forwarder.join().unwrap();
		assert_eq!(received.len(), payload.len());
	}

	#[test]
	fn revert_restores_exact_handles() {
		let dir = tempfile::tempdir().unwrap();
		let mut ambient = file_handles(dir.path());
		let before = ambient.raw_fds();
		let stage = resolve(
			StdinTarget::Inherit,
			StdoutTarget::Overwrite(PathBuf::from("stage")),
			StderrTarget::Inherit,
			&ambient,
			dir.path(),
			false,
		).unwrap();
		let snapshot = RedirectSnapshot::apply(&mut ambient, stage.handles, stage.redirected);
		assert_eq!(snapshot.resets(), [false, true, false]);
		assert_eq!(ambient.raw_fds()[0], before[0]);
		assert!(ambient.raw_fds()[1] != before[1]);
		ambient.stdout().write_all(b"during").unwrap();
		snapshot.revert(&mut ambient);
		assert_eq!(ambient.raw_fds(), before);
		assert_eq!(fs::read_to_string(dir.path().join("stage")).unwrap(), "during");
	}

	#[test]
	fn guard_reverts_on_unwind() {
		let dir = tempfile::tempdir().unwrap();
		let mut ambient = file_handles(dir.path());
		let before = ambient.raw_fds();
		let stage = file_handles(dir.path());
		let result = panic::catch_unwind(AssertUnwindSafe(|| {
			let guarded = Redirected::apply(&mut ambient, stage, [true, true, true]);
			assert!(guarded.raw_fds() != before);
			panic!("builtin failed");
		}));
		assert!(result.is_err());
		assert_eq!(ambient.raw_fds(), before);
	}
}
