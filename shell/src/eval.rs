use std::io::{self, Write};
use std::mem;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::{self, Pid};
use tracing::{debug, warn};

use crate::error::{ExecError, ParseError, SpawnError};
use crate::global::State;
use crate::job::{ChildProcess, JobId, EXIT_LOST, NO_JOB};
use crate::{parser, plan};
use crate::redirect::{self, Redirected, StageHandles, StdHandles};
use crate::types::{ChainRelation, ExecContext, ExecPlan, StderrTarget, StdinTarget, StdoutTarget};

const FALLBACK_INTERPRETER: &str = "sh";

/// What became of one launched stage.
#[derive(Debug)]
enum Launched {
	/// A builtin, already finished.
	Finished(i32),
	/// A child process; `job` is `NO_JOB` unless it was registered.
	Process { process: ChildProcess, job: JobId },
}

fn report_error(state: &State, e: &ExecError) {
	let _ = writeln!(state.io.stderr(), "ish: {}", e);
}

fn spawn_error(program: &Path, name: &str, e: io::Error) -> SpawnError {
	if e.raw_os_error() == Some(libc::ENOEXEC) {
		return SpawnError::NotExecutable(program.to_path_buf());
	}
	match e.kind() {
		io::ErrorKind::NotFound => SpawnError::CommandNotFound(name.to_string()),
		io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_path_buf()),
		_ => SpawnError::Io { path: program.to_path_buf(), source: e },
	}
}

fn spawn_process(program: &Path, argv: &[String], handles: &StdHandles, cwd: &Path, detached: bool) -> io::Result<Pid> {
	let mut command = Command::new(program);
	if let Some((name, args)) = argv.split_first() {
		command.arg0(name).args(args);
	}
	command
		.current_dir(cwd)
		.stdin(handles.stdin.to_stdio()?)
		.stdout(handles.stdout.to_stdio()?)
		.stderr(handles.stderr.to_stdio()?);
	if detached {
		// SAFETY: setsid is async-signal-safe and touches no parent state.
		unsafe {
			command.pre_exec(|| unistd::setsid().map(drop).map_err(io::Error::from));
		}
	}
	// The std handle is dropped without waiting; the pid is reaped by
	// waitpid through ChildProcess or the job table.
	let child = command.spawn()?;
	Ok(Pid::from_raw(child.id() as i32))
}

/// Spawns `program`, retrying images the kernel does not recognize through
/// the shell interpreter.
fn spawn(program: PathBuf, argv: &[String], handles: &StdHandles, cwd: &Path, detached: bool) -> Result<Pid, SpawnError> {
	let name = argv.first().map_or("", String::as_str);
	match spawn_process(&program, argv, handles, cwd, detached) {
		Ok(pid) => Ok(pid),
		Err(e) => match spawn_error(&program, name, e) {
			SpawnError::NotExecutable(path) => {
				debug!(program = %path.display(), "retrying through {}", FALLBACK_INTERPRETER);
				let mut retry = vec![FALLBACK_INTERPRETER.to_string(), path.to_string_lossy().into_owned()];
				retry.extend(argv.iter().skip(1).cloned());
				spawn_process(Path::new(FALLBACK_INTERPRETER), &retry, handles, cwd, detached)
					.map_err(|source| SpawnError::Io { path, source })
			},
			other => Err(other),
		},
	}
}

fn run_builtin(state: &mut State, builtin: crate::builtin::BuiltinFn, argv: &[String], stage: StageHandles) -> Result<i32, ExecError> {
	let StageHandles { handles, redirected, relay, .. } = stage;
	let code = {
		let mut guarded = Redirected::apply(state, handles, redirected);
		builtin(&mut guarded, argv)
	};
	if let Some(relay) = relay {
		relay.start()?;
	}
	Ok(code)
}

/// Opens the stage's redirections and starts it: builtins run to
/// completion here, programs are spawned and registered as jobs when they
/// are not awaited or capture output.
fn launch_stage(state: &mut State, mut ctx: ExecContext) -> Result<Launched, ExecError> {
	let argv = ctx.cmd.argv();
	let builtin = state.builtins.lookup(ctx.cmd.name());

	if ctx.run_on_second_console && ctx.stdin.is_inherit() {
		ctx.stdin = StdinTarget::Null;
	}
	let relay_stdout = builtin.is_some() && ctx.relation.is_concurrent();
	let stage = redirect::resolve(
		mem::replace(&mut ctx.stdin, StdinTarget::Inherit),
		mem::replace(&mut ctx.stdout, StdoutTarget::Inherit),
		mem::replace(&mut ctx.stderr, StderrTarget::Inherit),
		&state.io,
		&state.cwd,
		relay_stdout,
	)?;

	if let Some(builtin) = builtin {
		debug!(stage = %ctx.text, "running builtin");
		return run_builtin(state, builtin, &argv, stage).map(Launched::Finished);
	}

	let name = ctx.cmd.name();
	let program = state.search_cache.resolve(name, &state.cwd).ok_or_else(|| SpawnError::CommandNotFound(name.to_string()))?;
	let pid = spawn(program, &argv, &stage.handles, &state.cwd, ctx.run_on_second_console)?;
	debug!(stage = %ctx.text, pid = pid.as_raw(), "spawned");

	let StageHandles { stdout_buffer, stderr_buffer, .. } = stage;
	let mut job = NO_JOB;
	if !ctx.wait_for_completion || stdout_buffer.is_some() || stderr_buffer.is_some() {
		job = state.jobs.create_job(&ctx, pid, stdout_buffer, stderr_buffer);
		state.last_job_id = job;
	}
	Ok(Launched::Process { process: ChildProcess::new(pid), job })
}

fn await_stage(state: &State, launched: Launched) -> i32 {
	match launched {
		Launched::Finished(code) => code,
		Launched::Process { job, .. } if job != NO_JOB => state.jobs.wait(job).unwrap_or_else(|e| {
			warn!(job, error = %e, "cannot wait for job");
			EXIT_LOST
		}),
		Launched::Process { mut process, .. } => process.wait().unwrap_or_else(|e| {
			warn!(pid = process.pid.as_raw(), error = %e, "cannot wait for process");
			EXIT_LOST
		}),
	}
}

/// Runs one group of pipe-connected stages and returns its exit code.
///
/// Every stage is launched before any is awaited. A stage that cannot be
/// launched cuts the group short; the stages after it are dropped, which
/// closes their pipe ends.
fn run_group(state: &mut State, group: Vec<ExecContext>) -> i32 {
	let awaited = group.last().map_or(true, |ctx| ctx.wait_for_completion);
	let mut launched = Vec::with_capacity(group.len());
	let mut incoming = ChainRelation::None;
	let mut failure = None;

	for ctx in group {
		if !incoming.permits(0) {
			debug!(stage = %ctx.text, "not launched");
			continue;
		}
		let relation = ctx.relation;
		match launch_stage(state, ctx) {
			Ok(l) => {
				launched.push(l);
				incoming = relation;
			},
			Err(e) => {
				report_error(state, &e);
				failure = Some(e.exit_code());
				incoming = ChainRelation::Never;
			},
		}
	}

	if !awaited {
		return failure.unwrap_or(0);
	}
	let mut code = 0;
	for l in launched {
		code = await_stage(state, l);
	}
	failure.unwrap_or(code)
}

/// Evaluates a plan group by group. A group runs when the relation leading
/// into it permits the last evaluated exit code; skipped groups leave the
/// exit code alone.
pub fn execute_plan(state: &mut State, plan: ExecPlan) -> i32 {
	let mut stages = plan.into_stages().into_iter();
	let mut incoming = ChainRelation::None;
	let mut code = state.last_exit_code;

	loop {
		let mut group = Vec::new();
		for ctx in stages.by_ref() {
			let concurrent = ctx.relation.is_concurrent();
			group.push(ctx);
			if !concurrent {
				break;
			}
		}
		let outgoing = match group.last() {
			Some(ctx) => ctx.relation,
			None => break,
		};
		if incoming.permits(code) {
			code = run_group(state, group);
			state.last_exit_code = code;
		} else {
			debug!(stages = group.len(), "skipped");
		}
		incoming = outgoing;
	}
	code
}

/// Parses and runs one command line, returning its exit code. Re-entrant:
/// builtins may call it again with the same state.
///
/// An empty line leaves the last exit code untouched. Parse failures are
/// reported on the ambient stderr.
pub fn execute_expression(state: &mut State, line: &str) -> i32 {
	let code = match plan::build_plan(line) {
		Ok(plan) => execute_plan(state, plan),
		Err(ExecError::Parse(ParseError::Empty)) => return state.last_exit_code,
		Err(e) => {
			report_error(state, &e);
			e.exit_code()
		},
	};
	state.last_exit_code = code;
	code
}

fn run_builtin_line(state: &mut State, line: &str) -> Result<i32, ExecError> {
	let mut ctx = plan::build_exec_context(line)?;
	let builtin = state.builtins.lookup(ctx.cmd.name()).ok_or_else(|| ExecError::BuiltinNotFound(ctx.cmd.name().to_string()))?;
	let stage = redirect::resolve(
		mem::replace(&mut ctx.stdin, StdinTarget::Inherit),
		mem::replace(&mut ctx.stdout, StdoutTarget::Inherit),
		mem::replace(&mut ctx.stderr, StderrTarget::Inherit),
		&state.io,
		&state.cwd,
		false,
	)?;
	run_builtin(state, builtin, &ctx.cmd.argv(), stage)
}

/// Runs one command line as a single builtin, never falling back to a
/// program. Chain operators are ordinary arguments here; redirections
/// apply as usual.
pub fn execute_builtin(state: &mut State, line: &str) -> i32 {
	if parser::tokenize(line).is_empty() {
		return state.last_exit_code;
	}
	let code = match run_builtin_line(state, line) {
		Ok(code) => code,
		Err(e) => {
			report_error(state, &e);
			e.exit_code()
		},
	};
	state.last_exit_code = code;
	code
}
