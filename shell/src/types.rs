use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
	pub text: String,
	pub quoted: bool,
}

impl Token {
	pub fn new(text: impl Into<String>, quoted: bool) -> Token {
		Token { text: text.into(), quoted }
	}
}

/// One stage's arguments, program name first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdContext {
	pub args: Vec<Token>,
}

impl CmdContext {
	pub fn name(&self) -> &str {
		self.args.first().map_or("", |t| t.text.as_str())
	}

	pub fn argv(&self) -> Vec<String> {
		self.args.iter().map(|t| t.text.clone()).collect()
	}

	pub fn is_empty(&self) -> bool {
		self.args.is_empty()
	}
}

#[derive(Debug)]
pub enum StdinTarget {
	Inherit,
	File(PathBuf),
	Null,
	Pipe(OwnedFd),
}

#[derive(Debug)]
pub enum StdoutTarget {
	Inherit,
	Overwrite(PathBuf),
	Append(PathBuf),
	Null,
	Pipe(OwnedFd),
	Buffer,
}

#[derive(Debug)]
pub enum StderrTarget {
	Inherit,
	Overwrite(PathBuf),
	Append(PathBuf),
	Null,
	Buffer,
	SameAsStdout,
}

impl StdinTarget {
	pub fn is_inherit(&self) -> bool {
		matches!(*self, StdinTarget::Inherit)
	}
}

impl StdoutTarget {
	pub fn is_inherit(&self) -> bool {
		matches!(*self, StdoutTarget::Inherit)
	}
}

impl StderrTarget {
	pub fn is_inherit(&self) -> bool {
		matches!(*self, StderrTarget::Inherit)
	}
}

/// How the following stage runs relative to this one.
///
/// `Concurrent` records the identity of the pipe joining the two stages; the
/// ends themselves are owned by the stdout/stdin targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRelation {
	None,
	Unconditional,
	Concurrent { write: RawFd, read: RawFd },
	OnFailure,
	OnSuccess,
	Never,
}

impl ChainRelation {
	pub fn is_concurrent(self) -> bool {
		matches!(self, ChainRelation::Concurrent { .. })
	}

	/// Whether the stage after this relation runs, given the last evaluated
	/// exit code.
	pub fn permits(self, last_exit_code: i32) -> bool {
		match self {
			ChainRelation::None | ChainRelation::Unconditional | ChainRelation::Concurrent { .. } => true,
			ChainRelation::OnSuccess => last_exit_code == 0,
			ChainRelation::OnFailure => last_exit_code != 0,
			ChainRelation::Never => false,
		}
	}
}

#[derive(Debug)]
pub struct ExecContext {
	pub cmd: CmdContext,
	pub stdin: StdinTarget,
	pub stdout: StdoutTarget,
	pub stderr: StderrTarget,
	pub wait_for_completion: bool,
	pub run_on_second_console: bool,
	pub relation: ChainRelation,
	/// Source text of the stage, kept for job listings.
	pub text: String,
}

impl ExecContext {
	pub fn new(cmd: CmdContext, text: impl Into<String>) -> ExecContext {
		ExecContext {
			cmd,
			stdin: StdinTarget::Inherit,
			stdout: StdoutTarget::Inherit,
			stderr: StderrTarget::Inherit,
			wait_for_completion: true,
			run_on_second_console: false,
			relation: ChainRelation::None,
			text: text.into(),
		}
	}

	pub fn wants_buffer(&self) -> bool {
		matches!(self.stdout, StdoutTarget::Buffer) || matches!(self.stderr, StderrTarget::Buffer)
	}
}

#[derive(Debug)]
pub struct ExecPlan {
	stages: Vec<ExecContext>,
}

impl ExecPlan {
	pub(crate) fn new(stages: Vec<ExecContext>) -> ExecPlan {
		let plan = ExecPlan { stages };
		debug_assert!(plan.is_well_formed());
		plan
	}

	pub fn stages(&self) -> &[ExecContext] {
		&self.stages
	}

	pub fn len(&self) -> usize {
		self.stages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.stages.is_empty()
	}

	pub fn into_stages(self) -> Vec<ExecContext> {
		self.stages
	}

	/// Checks the linking invariants: non-empty, last relation `None`, and
	/// every `Concurrent` pipe matching the targets on both sides of it.
	pub fn is_well_formed(&self) -> bool {
		let last = match self.stages.last() {
			Some(l) => l,
			None => return false,
		};
		if last.relation != ChainRelation::None {
			return false;
		}
		self.stages.windows(2).all(|pair| match pair[0].relation {
			ChainRelation::Concurrent { write, read } => {
				let out_ok = matches!(pair[0].stdout, StdoutTarget::Pipe(ref fd) if fd.as_raw_fd() == write);
				let in_ok = matches!(pair[1].stdin, StdinTarget::Pipe(ref fd) if fd.as_raw_fd() == read);
				out_ok && in_ok
			},
			ChainRelation::None => false,
			_ => true,
		})
	}
}
