use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::{env, fs};

use tracing::debug;

use crate::global::State;
use crate::job::{JobId, PriorityClass, NO_JOB};

/// Callback run in-process for a builtin command. Receives the full argv,
/// name included, and returns the exit code.
pub type BuiltinFn = Arc<dyn Fn(&mut State, &[String]) -> i32 + Send + Sync>;

/// Case-insensitive registry of builtin commands.
///
/// Lookups hand out a clone of the callback so the lock is never held while
/// a builtin runs; a builtin may therefore register or unregister commands
/// itself.
pub struct BuiltinTable {
	imp: Mutex<HashMap<String, BuiltinFn>>,
}

impl Default for BuiltinTable {
	fn default() -> BuiltinTable {
		BuiltinTable::new()
	}
}

impl BuiltinTable {
	pub fn new() -> BuiltinTable {
		BuiltinTable { imp: Mutex::new(HashMap::new()) }
	}

	pub fn with_defaults() -> BuiltinTable {
		let table = BuiltinTable::new();
		table.register_fn("cd", builtin_cd);
		table.register_fn("rehash", builtin_rehash);
		table.register_fn("pushd", builtin_pushd);
		table.register_fn("exit", builtin_exit);
		table.register_fn("job", builtin_job);
		table.register_fn("wait", builtin_wait);
		table
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, BuiltinFn>> {
		self.imp.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Adds a builtin. Fails if the name is already taken.
	pub fn register(&self, name: &str, callback: BuiltinFn) -> bool {
		let mut imp = self.lock();
		let key = name.to_lowercase();
		if imp.contains_key(&key) {
			return false;
		}
		debug!(builtin = %key, "registered");
		imp.insert(key, callback);
		true
	}

	pub fn register_fn(&self, name: &str, callback: fn(&mut State, &[String]) -> i32) -> bool {
		self.register(name, Arc::new(callback))
	}

	/// Removes `name` only while it is still bound to `callback`, so a
	/// stale unregister cannot drop a later registration.
	pub fn unregister(&self, name: &str, callback: &BuiltinFn) -> bool {
		let mut imp = self.lock();
		let key = name.to_lowercase();
		match imp.get(&key) {
			Some(current) if Arc::ptr_eq(current, callback) => {},
			_ => return false,
		}
		imp.remove(&key);
		debug!(builtin = %key, "unregistered");
		true
	}

	pub fn lookup(&self, name: &str) -> Option<BuiltinFn> {
		self.lock().get(&name.to_lowercase()).cloned()
	}

	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.lock().keys().cloned().collect();
		names.sort();
		names
	}
}

fn report(state: &State, command: &str, message: &str) -> i32 {
	let _ = writeln!(state.io.stderr(), "{}: {}", command, message);
	1
}

fn change_directory(state: &mut State, target: &str) -> Result<(), String> {
	let path = state.cwd.join(target);
	let path = fs::canonicalize(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
	if !path.is_dir() {
		return Err(format!("{}: not a directory", path.display()));
	}
	state.cwd = path;
	Ok(())
}

pub fn builtin_cd(state: &mut State, argv: &[String]) -> i32 {
	let target = match argv.get(1) {
		Some(t) => t.clone(),
		None => match env::var("HOME") {
			Ok(home) => home,
			Err(_) => return report(state, "cd", "HOME is not set"),
		},
	};
	match change_directory(state, &target) {
		Ok(()) => 0,
		Err(e) => report(state, "cd", &e),
	}
}

pub fn builtin_rehash(state: &mut State, _: &[String]) -> i32 {
	state.search_cache.rehash();
	0
}

pub fn builtin_pushd(state: &mut State, argv: &[String]) -> i32 {
	let target = match argv.get(1) {
		Some(t) => t,
		None => return report(state, "pushd", "missing argument"),
	};
	let previous: PathBuf = state.cwd.clone();
	if let Err(e) = change_directory(state, target) {
		return report(state, "pushd", &e);
	}
	state.dir_stack.push(previous);
	if state.dir_stack.len() == 1 {
		state.builtins.register("popd", popd_callback());
	}
	0
}

fn popd_callback() -> BuiltinFn {
	static POPD: OnceLock<BuiltinFn> = OnceLock::new();
	Arc::clone(POPD.get_or_init(|| Arc::new(builtin_popd) as BuiltinFn))
}

/// Only registered while the directory stack is non-empty.
pub fn builtin_popd(state: &mut State, _: &[String]) -> i32 {
	let previous = match state.dir_stack.pop() {
		Some(p) => p,
		None => return 1,
	};
	if state.dir_stack.is_empty() {
		state.builtins.unregister("popd", &popd_callback());
	}
	if !previous.is_dir() {
		return report(state, "popd", &format!("{}: no longer a directory", previous.display()));
	}
	state.cwd = previous;
	0
}

pub fn builtin_exit(state: &mut State, argv: &[String]) -> i32 {
	let code = match argv.get(1).map(|a| a.parse::<i32>()) {
		None => state.last_exit_code,
		Some(Ok(c)) => c,
		Some(Err(_)) => return report(state, "exit", "numeric argument required"),
	};
	state.exit_requested = Some(code);
	code
}

fn parse_job_id(state: &State, command: &str, arg: Option<&String>) -> Result<JobId, i32> {
	match arg.map(|a| a.parse::<JobId>()) {
		Some(Ok(id)) if id != NO_JOB => Ok(id),
		Some(_) => Err(report(state, command, "invalid job id")),
		None => Err(report(state, command, "missing job id")),
	}
}

fn list_jobs(state: &State) -> i32 {
	let jobs = Arc::clone(&state.jobs);
	let mut out = state.io.stdout();
	jobs.scan_for_completion();
	let mut id = jobs.next_job_id(NO_JOB);
	while id != NO_JOB {
		if let Ok(info) = jobs.job_information(id) {
			let status = if info.completed { format!("completed ({})", info.exit_code) } else { "running".to_string() };
			let output = if info.has_output { ", output" } else { "" };
			let _ = writeln!(out, "job {}: {}{}: {}", id, status, output, info.command_line);
		}
		id = jobs.next_job_id(id);
	}
	let collected = jobs.collect_garbage();
	if collected > 0 {
		debug!(collected, "removed finished jobs");
	}
	0
}

pub fn builtin_job(state: &mut State, argv: &[String]) -> i32 {
	let sub = match argv.get(1) {
		None => return list_jobs(state),
		Some(s) => s.to_lowercase(),
	};
	let jobs = Arc::clone(&state.jobs);

	if let Ok(id) = sub.parse::<JobId>() {
		return match jobs.job_information(id) {
			Ok(info) => {
				let _ = writeln!(state.io.stdout(), "job {}: completed={} exit={} output={} {}",
					id, info.completed, info.exit_code, info.has_output, info.command_line);
				0
			},
			Err(e) => report(state, "job", &e.to_string()),
		};
	}

	let id = match parse_job_id(state, "job", argv.get(2)) {
		Ok(id) => id,
		Err(code) => return code,
	};
	match sub.as_str() {
		"wait" => match jobs.wait(id) {
			Ok(code) => code,
			Err(e) => report(state, "job", &e.to_string()),
		},
		"terminate" | "kill" => if jobs.terminate(id) { 0 } else { report(state, "job", "cannot terminate") },
		"output" | "errors" => {
			let result = if sub == "output" {
				jobs.pipe_output(id, Some(&mut state.io.stdout()), None)
			} else {
				jobs.pipe_output(id, None, Some(&mut state.io.stderr()))
			};
			match result {
				Ok(()) => 0,
				Err(e) => report(state, "job", &e.to_string()),
			}
		},
		"nice" | "priority" => {
			let class = match argv.get(3).map(|c| c.parse::<PriorityClass>()) {
				Some(Ok(class)) => class,
				Some(Err(e)) => return report(state, "job", &e),
				None => return report(state, "job", "missing priority class"),
			};
			if jobs.set_priority(id, class) { 0 } else { report(state, "job", "cannot change priority") }
		},
		_ => report(state, "job", &format!("unknown subcommand: {}", sub)),
	}
}

pub fn builtin_wait(state: &mut State, argv: &[String]) -> i32 {
	let jobs = Arc::clone(&state.jobs);
	if argv.len() > 1 {
		let id = match parse_job_id(state, "wait", argv.get(1)) {
			Ok(id) => id,
			Err(code) => return code,
		};
		return match jobs.wait(id) {
			Ok(code) => code,
			Err(e) => report(state, "wait", &e.to_string()),
		};
	}
	let mut code = 0;
	let mut id = jobs.next_job_id(NO_JOB);
	while id != NO_JOB {
		if let Ok(c) = jobs.wait(id) {
			code = c;
		}
		id = jobs.next_job_id(id);
	}
	code
}
