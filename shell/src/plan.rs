use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::unistd;
use tracing::debug;

use crate::error::{ExecError, ParseError};
use crate::parser::{self, Operator, Stage};
use crate::types::*;

fn is_null_device(target: &str) -> bool {
	target.eq_ignore_ascii_case("nul") || target == "/dev/null"
}

fn input_target(target: &str) -> StdinTarget {
	if is_null_device(target) { StdinTarget::Null } else { StdinTarget::File(PathBuf::from(target)) }
}

fn output_target(target: &str, append: bool) -> StdoutTarget {
	match (is_null_device(target), append) {
		(true, _) => StdoutTarget::Null,
		(false, false) => StdoutTarget::Overwrite(PathBuf::from(target)),
		(false, true) => StdoutTarget::Append(PathBuf::from(target)),
	}
}

fn error_target(target: &str, append: bool) -> StderrTarget {
	match (is_null_device(target), append) {
		(true, _) => StderrTarget::Null,
		(false, false) => StderrTarget::Overwrite(PathBuf::from(target)),
		(false, true) => StderrTarget::Append(PathBuf::from(target)),
	}
}

/// Builds one stage from its sub-line.
///
/// Redirection operators are recognized only as whole, unquoted tokens. The
/// operator and its target are dropped from the argument list; a later
/// redirection of the same stream replaces an earlier one.
pub fn build_exec_context(text: &str) -> Result<ExecContext, ParseError> {
	let mut tokens = parser::tokenize(text).into_iter();
	let mut cmd = CmdContext::default();
	let mut ctx = ExecContext::new(CmdContext::default(), text);

	while let Some(token) = tokens.next() {
		if token.quoted {
			cmd.args.push(token);
			continue;
		}
		match token.text.as_str() {
			"2>&1" => { ctx.stderr = StderrTarget::SameAsStdout; continue; },
			">!" | "1>!" => { ctx.stdout = StdoutTarget::Buffer; continue; },
			"2>!" => { ctx.stderr = StderrTarget::Buffer; continue; },
			"<" | ">" | "1>" | ">>" | "1>>" | "2>" | "2>>" => {},
			_ => { cmd.args.push(token); continue; },
		}
		let op = token.text;
		let target = match tokens.next() {
			Some(t) => t.text,
			None => return Err(ParseError::MissingRedirectTarget(op)),
		};
		match op.as_str() {
			"<" => ctx.stdin = input_target(&target),
			">" | "1>" => ctx.stdout = output_target(&target, false),
			">>" | "1>>" => ctx.stdout = output_target(&target, true),
			"2>" => ctx.stderr = error_target(&target, false),
			_ => ctx.stderr = error_target(&target, true),
		}
	}

	if cmd.is_empty() {
		return Err(ParseError::MissingCommand(text.to_string()));
	}
	ctx.cmd = cmd;
	Ok(ctx)
}

fn relation_for(op: Option<Operator>) -> ChainRelation {
	match op {
		None => ChainRelation::None,
		Some(Operator::And) => ChainRelation::OnSuccess,
		Some(Operator::Or) => ChainRelation::OnFailure,
		// Filled in with the pipe identity once it exists.
		Some(Operator::Pipe) => ChainRelation::None,
		Some(_) => ChainRelation::Unconditional,
	}
}

/// Creates an anonymous pipe whose ends are not inherited by children unless
/// installed as one of their standard handles.
pub fn create_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
	#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
	{
		unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
	}
	#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
	{
		use nix::fcntl::{fcntl, FcntlArg, FdFlag};
		let (read, write) = unistd::pipe()?;
		fcntl(read.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
		fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
		Ok((read, write))
	}
}

/// Joins `stages[at]` to the stage after it with a fresh pipe.
fn link_concurrent(stages: &mut [ExecContext], at: usize) -> nix::Result<()> {
	let (read, write) = create_pipe()?;
	let relation = ChainRelation::Concurrent { write: write.as_raw_fd(), read: read.as_raw_fd() };
	if !stages[at].stdout.is_inherit() {
		debug!(stage = %stages[at].text, "pipe replaces stdout redirection");
	}
	if !stages[at + 1].stdin.is_inherit() {
		debug!(stage = %stages[at + 1].text, "pipe replaces stdin redirection");
	}
	stages[at].stdout = StdoutTarget::Pipe(write);
	stages[at].relation = relation;
	stages[at + 1].stdin = StdinTarget::Pipe(read);
	Ok(())
}

/// Marks the pipe group ending at `last` as not awaited.
fn apply_background(stages: &mut [ExecContext], last: usize, op: Operator) {
	let mut first = last;
	while first > 0 && stages[first - 1].relation.is_concurrent() {
		first -= 1;
	}
	for stage in &mut stages[first..=last] {
		stage.wait_for_completion = false;
		if op == Operator::BackgroundDetached {
			stage.run_on_second_console = true;
		}
	}
	if op == Operator::BackgroundBuffered {
		let stage = &mut stages[last];
		if stage.stdout.is_inherit() {
			stage.stdout = StdoutTarget::Buffer;
		}
		if stage.stderr.is_inherit() {
			stage.stderr = StderrTarget::Buffer;
		}
	}
}

fn assemble(split: &[Stage<'_>]) -> Result<ExecPlan, ExecError> {
	let mut stages = Vec::with_capacity(split.len());
	for (n, stage) in split.iter().enumerate() {
		if stage.text.is_empty() {
			let op = stage.op.or(if n > 0 { split[n - 1].op } else { None });
			return Err(ParseError::MissingCommand(op.map_or("", Operator::as_str).to_string()).into());
		}
		let mut ctx = build_exec_context(stage.text)?;
		ctx.relation = relation_for(stage.op);
		stages.push(ctx);
	}

	let last = split.len() - 1;
	if let Some(op) = split[last].op {
		if op.needs_successor() {
			return Err(ParseError::MissingCommand(op.as_str().to_string()).into());
		}
	}

	for (n, stage) in split.iter().enumerate() {
		match stage.op {
			Some(Operator::Pipe) => link_concurrent(&mut stages, n)?,
			Some(op) if op.is_background() => apply_background(&mut stages, n, op),
			_ => {},
		}
	}
	stages[last].relation = ChainRelation::None;
	Ok(ExecPlan::new(stages))
}

/// Turns a command line into a linked execution plan.
///
/// Fails with `ParseError::Empty` when the line holds no stage at all. Pipes
/// allocated before a failure are closed when the partial plan is dropped.
pub fn build_plan(line: &str) -> Result<ExecPlan, ExecError> {
	let split = parser::split_stages(line);
	if split.is_empty() {
		return Err(ParseError::Empty.into());
	}
	let plan = assemble(&split)?;
	debug!(stages = plan.len(), line, "built execution plan");
	Ok(plan)
}
