use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobId;

/// Exit code reported when no program by that name exists.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when a program exists but could not be started.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

#[derive(Debug, Error)]
pub enum ParseError {
	#[error("nothing to execute")]
	Empty,
	#[error("missing command before or after `{0}`")]
	MissingCommand(String),
	#[error("missing target after redirection `{0}`")]
	MissingRedirectTarget(String),
}

#[derive(Debug, Error)]
pub enum RedirectionError {
	#[error("cannot open {}: {source}", .path.display())]
	Open { path: PathBuf, source: io::Error },
	#[error("cannot create pipe: {0}")]
	Pipe(#[from] nix::Error),
	#[error("cannot duplicate standard handle: {0}")]
	Duplicate(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("command not found: {0}")]
	CommandNotFound(String),
	#[error("permission denied: {}", .0.display())]
	PermissionDenied(PathBuf),
	/// The kernel refused the image format; retry through `sh`.
	#[error("not an executable image: {}", .0.display())]
	NotExecutable(PathBuf),
	#[error("cannot start {}: {source}", .path.display())]
	Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
	#[error("no such job: {0}")]
	NotFound(JobId),
	#[error("job {0} is still running")]
	StillRunning(JobId),
	#[error("job {0} has no captured output")]
	NoOutput(JobId),
}

#[derive(Debug, Error)]
pub enum ExecError {
	#[error(transparent)]
	Parse(#[from] ParseError),
	#[error(transparent)]
	Redirection(#[from] RedirectionError),
	#[error(transparent)]
	Spawn(#[from] SpawnError),
	#[error(transparent)]
	Job(#[from] JobError),
	#[error("builtin not found: {0}")]
	BuiltinNotFound(String),
	#[error("system error: {0}")]
	Nix(#[from] nix::Error),
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

impl ExecError {
	pub fn exit_code(&self) -> i32 {
		match *self {
			ExecError::Spawn(SpawnError::CommandNotFound(_)) | ExecError::BuiltinNotFound(_) => EXIT_NOT_FOUND,
			ExecError::Spawn(_) => EXIT_CANNOT_EXECUTE,
			_ => 1,
		}
	}
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("cannot read {}: {source}", .path.display())]
	Read { path: PathBuf, source: io::Error },
	#[error("invalid configuration in {}: {source}", .path.display())]
	Parse { path: PathBuf, source: toml::de::Error },
}
