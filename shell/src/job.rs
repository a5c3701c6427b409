use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::buffer::ProcessBuffer;
use crate::error::JobError;
use crate::types::ExecContext;

pub type JobId = u32;

/// Reserved id meaning "no job".
pub const NO_JOB: JobId = 0;

/// Exit code recorded when a job's process vanished without a status.
pub const EXIT_LOST: i32 = 255;

pub trait WaitStatusExt {
	/// The exit code once the process is gone, `None` while it lives.
	fn exit_code(self) -> Option<i32>;
}

impl WaitStatusExt for WaitStatus {
	fn exit_code(self) -> Option<i32> {
		match self {
			WaitStatus::Exited(_, code) => Some(code),
			WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
			_ => None,
		}
	}
}

/// A spawned child reaped through `waitpid`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChildProcess {
	pub pid: Pid,
	pub status: WaitStatus,
}

impl ChildProcess {
	pub fn new(pid: Pid) -> ChildProcess {
		ChildProcess { pid, status: WaitStatus::StillAlive }
	}

	pub fn exit_code(&self) -> Option<i32> {
		self.status.exit_code()
	}

	/// Non-blocking liveness check. `ECHILD` means someone else reaped it.
	pub fn poll(&mut self) -> nix::Result<Option<i32>> {
		if let Some(code) = self.exit_code() {
			return Ok(Some(code));
		}
		let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))?;
		if status.exit_code().is_some() {
			self.status = status;
		}
		Ok(self.exit_code())
	}

	/// Blocks until the process exits.
	pub fn wait(&mut self) -> nix::Result<i32> {
		loop {
			if let Some(code) = self.exit_code() {
				return Ok(code);
			}
			match waitpid(self.pid, None) {
				Ok(status) => self.status = status,
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(e),
			}
		}
	}
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PriorityClass {
	Idle,
	BelowNormal,
	Normal,
	AboveNormal,
	High,
	Realtime,
}

impl PriorityClass {
	pub fn nice_value(self) -> libc::c_int {
		match self {
			PriorityClass::Idle => 19,
			PriorityClass::BelowNormal => 10,
			PriorityClass::Normal => 0,
			PriorityClass::AboveNormal => -5,
			PriorityClass::High => -10,
			PriorityClass::Realtime => -20,
		}
	}
}

impl FromStr for PriorityClass {
	type Err = String;

	fn from_str(s: &str) -> Result<PriorityClass, String> {
		match s.to_ascii_lowercase().as_str() {
			"idle" => Ok(PriorityClass::Idle),
			"belownormal" | "low" => Ok(PriorityClass::BelowNormal),
			"normal" => Ok(PriorityClass::Normal),
			"abovenormal" => Ok(PriorityClass::AboveNormal),
			"high" => Ok(PriorityClass::High),
			"realtime" => Ok(PriorityClass::Realtime),
			_ => Err(format!("unknown priority class: {}", s)),
		}
	}
}

impl fmt::Display for PriorityClass {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let name = match *self {
			PriorityClass::Idle => "idle",
			PriorityClass::BelowNormal => "belownormal",
			PriorityClass::Normal => "normal",
			PriorityClass::AboveNormal => "abovenormal",
			PriorityClass::High => "high",
			PriorityClass::Realtime => "realtime",
		};
		f.write_str(name)
	}
}

#[derive(Debug)]
pub struct Job {
	pub id: JobId,
	pub process: ChildProcess,
	pub completed: bool,
	pub exit_code: i32,
	pub command_line: String,
	pub priority: PriorityClass,
	stdout: Option<ProcessBuffer>,
	stderr: Option<ProcessBuffer>,
	output_collected: bool,
}

impl Job {
	pub fn has_output(&self) -> bool {
		self.stdout.is_some() || self.stderr.is_some()
	}

	fn record_exit(&mut self, code: i32) {
		self.completed = true;
		self.exit_code = code;
		debug!(job = self.id, code, "job completed");
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInformation {
	pub completed: bool,
	pub has_output: bool,
	pub exit_code: i32,
	pub command_line: String,
}

#[derive(Debug)]
struct JobSet {
	last_id: JobId,
	jobs: BTreeMap<JobId, Job>,
}

/// Registry of jobs that were launched without being awaited.
///
/// Every access goes through one lock. The lock is never held while
/// blocking on a process.
#[derive(Debug)]
pub struct JobTable {
	imp: Mutex<JobSet>,
}

impl Default for JobTable {
	fn default() -> JobTable {
		JobTable::new()
	}
}

impl JobTable {
	pub fn new() -> JobTable {
		JobTable { imp: Mutex::new(JobSet { last_id: NO_JOB, jobs: BTreeMap::new() }) }
	}

	fn lock(&self) -> MutexGuard<'_, JobSet> {
		self.imp.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn with_job<T, F>(&self, id: JobId, f: F) -> Result<T, JobError> where F: FnOnce(&mut Job) -> T {
		let mut set = self.lock();
		set.jobs.get_mut(&id).map(f).ok_or(JobError::NotFound(id))
	}

	pub fn create_job(&self, ctx: &ExecContext, pid: Pid, stdout: Option<ProcessBuffer>, stderr: Option<ProcessBuffer>) -> JobId {
		let mut set = self.lock();
		set.last_id += 1;
		let id = set.last_id;
		set.jobs.insert(id, Job {
			id,
			process: ChildProcess::new(pid),
			completed: false,
			exit_code: 0,
			command_line: ctx.text.clone(),
			priority: PriorityClass::Normal,
			stdout,
			stderr,
			output_collected: false,
		});
		debug!(job = id, pid = pid.as_raw(), command = %ctx.text, "job created");
		id
	}

	/// Polls every running job once, returning the ids that finished.
	pub fn scan_for_completion(&self) -> Vec<JobId> {
		let mut set = self.lock();
		let mut finished = vec![];
		for job in set.jobs.values_mut().filter(|j| !j.completed) {
			match job.process.poll() {
				Ok(Some(code)) => job.record_exit(code),
				Ok(None) => continue,
				Err(Errno::ECHILD) => {
					warn!(job = job.id, "job process vanished");
					job.record_exit(EXIT_LOST);
				},
				Err(e) => {
					warn!(job = job.id, error = %e, "cannot poll job");
					continue;
				},
			}
			finished.push(job.id);
		}
		finished
	}

	/// Smallest tracked id above `previous`, or `NO_JOB`.
	pub fn next_job_id(&self, previous: JobId) -> JobId {
		let set = self.lock();
		let next = set.jobs.range((Bound::Excluded(previous), Bound::Unbounded)).next().map(|(&id, _)| id);
		next.unwrap_or(NO_JOB)
	}

	pub fn job_information(&self, id: JobId) -> Result<JobInformation, JobError> {
		self.with_job(id, |job| JobInformation {
			completed: job.completed,
			has_output: job.has_output(),
			exit_code: job.exit_code,
			command_line: job.command_line.clone(),
		})
	}

	/// Blocks until the job's process exits. Captured output keeps draining
	/// on its own.
	pub fn wait(&self, id: JobId) -> Result<i32, JobError> {
		let (mut process, completed) = self.with_job(id, |job| (job.process, job.completed))?;
		if completed {
			return self.with_job(id, |job| job.exit_code);
		}
		let waited = process.wait();
		self.with_job(id, |job| {
			if job.completed {
				return job.exit_code;
			}
			match waited {
				Ok(code) => {
					job.process = process;
					job.record_exit(code);
				},
				// Reaped by a concurrent scan that then lost the race to
				// record it; nothing is left to report.
				Err(Errno::ECHILD) => job.record_exit(EXIT_LOST),
				Err(e) => {
					warn!(job = id, error = %e, "wait failed");
					job.record_exit(EXIT_LOST);
				},
			}
			job.exit_code
		})
	}

	pub fn set_priority(&self, id: JobId, class: PriorityClass) -> bool {
		self.with_job(id, |job| {
			if job.completed {
				return false;
			}
			// SAFETY: plain syscall on a pid we spawned and have not reaped.
			let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, job.process.pid.as_raw() as libc::id_t, class.nice_value()) };
			if rc != 0 {
				warn!(job = id, error = %Errno::last(), "cannot change priority");
				return false;
			}
			job.priority = class;
			true
		}).unwrap_or(false)
	}

	pub fn terminate(&self, id: JobId) -> bool {
		self.with_job(id, |job| {
			if job.completed {
				return false;
			}
			match signal::kill(job.process.pid, Signal::SIGKILL) {
				Ok(()) => {
					info!(job = id, "job terminated");
					true
				},
				Err(e) => {
					warn!(job = id, error = %e, "cannot terminate job");
					false
				},
			}
		}).unwrap_or(false)
	}

	fn buffers(&self, id: JobId) -> Result<(Option<ProcessBuffer>, Option<ProcessBuffer>), JobError> {
		self.with_job(id, |job| (job.stdout.clone(), job.stderr.clone()))
	}

	/// Captured output of a finished job. Waits for the capture to reach
	/// end-of-stream, which may trail the process exit.
	pub fn output(&self, id: JobId) -> Result<(Vec<u8>, Vec<u8>), JobError> {
		let (out_buf, err_buf) = self.with_job(id, |job| {
			if !job.completed {
				return Err(JobError::StillRunning(id));
			}
			if !job.has_output() {
				return Err(JobError::NoOutput(id));
			}
			Ok((job.stdout.clone(), job.stderr.clone()))
		})??;
		let drain = |buffer: Option<ProcessBuffer>| buffer.map(|b| {
			b.await_final();
			b.snapshot()
		}).unwrap_or_default();
		let captured = (drain(out_buf), drain(err_buf));
		self.mark_collected(id);
		Ok(captured)
	}

	fn mark_collected(&self, id: JobId) {
		// The entry may have been collected meanwhile; the buffers were
		// cloned out, so nothing is lost.
		if self.with_job(id, |job| job.output_collected = true).is_err() {
			debug!(job = id, "job removed while its output was read");
		}
	}

	/// Streams captured output into the given writers, following it live if
	/// the job is still running. Streams without a writer are skipped.
	pub fn pipe_output(&self, id: JobId, stdout: Option<&mut dyn Write>, stderr: Option<&mut dyn Write>) -> Result<(), JobError> {
		let (out_buf, err_buf) = self.buffers(id)?;
		if out_buf.is_none() && err_buf.is_none() {
			return Err(JobError::NoOutput(id));
		}
		if let (Some(buffer), Some(target)) = (out_buf, stdout) {
			if let Err(e) = buffer.pipe_to(target) {
				warn!(job = id, error = %e, "cannot forward job output");
			}
		}
		if let (Some(buffer), Some(target)) = (err_buf, stderr) {
			if let Err(e) = buffer.pipe_to(target) {
				warn!(job = id, error = %e, "cannot forward job errors");
			}
		}
		self.mark_collected(id);
		Ok(())
	}

	/// Drops finished jobs whose output was collected or that never had any.
	pub fn collect_garbage(&self) -> usize {
		let mut set = self.lock();
		let before = set.jobs.len();
		set.jobs.retain(|_, job| !(job.completed && (job.output_collected || !job.has_output())));
		before - set.jobs.len()
	}

	pub fn len(&self) -> usize {
		self.lock().jobs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan::{build_exec_context, create_pipe};
	use pretty_assertions::assert_eq;
	use std::process::{Command, Stdio};

	fn spawn(script: &str) -> Pid {
		let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
		Pid::from_raw(child.id() as i32)
	}

	fn ctx(text: &str) -> ExecContext {
		build_exec_context(text).unwrap()
	}

	#[test]
	fn ids_increase_and_are_never_reused() {
		let table = JobTable::new();
		let a = table.create_job(&ctx("true"), spawn("exit 0"), None, None);
		let b = table.create_job(&ctx("true"), spawn("exit 0"), None, None);
		assert!(a != NO_JOB);
		assert!(b > a);
		table.wait(a).unwrap();
		table.wait(b).unwrap();
		assert_eq!(table.collect_garbage(), 2);
		assert!(table.is_empty());
		let c = table.create_job(&ctx("true"), spawn("exit 0"), None, None);
		assert!(c > b);
		table.wait(c).unwrap();
	}

	#[test]
	fn next_job_id_enumerates_in_order() {
		let table = JobTable::new();
		assert_eq!(table.next_job_id(NO_JOB), NO_JOB);
		let ids: Vec<JobId> = (0..3).map(|_| table.create_job(&ctx("true"), spawn("exit 0"), None, None)).collect();
		assert_eq!(table.next_job_id(NO_JOB), ids[0]);
		assert_eq!(table.next_job_id(ids[0]), ids[1]);
		assert_eq!(table.next_job_id(ids[2]), NO_JOB);
		for id in ids {
			table.wait(id).unwrap();
		}
	}

	#[test]
	fn completion_is_visible_only_after_scan_or_wait() {
		let table = JobTable::new();
		let id = table.create_job(&ctx("sh -c"), spawn("exit 3"), None, None);
		assert!(!table.job_information(id).unwrap().completed);
		let mut finished = vec![];
		while finished.is_empty() {
			finished = table.scan_for_completion();
			std::thread::sleep(std::time::Duration::from_millis(10));
		}
		assert_eq!(finished, vec![id]);
		let info = table.job_information(id).unwrap();
		assert!(info.completed);
		assert_eq!(info.exit_code, 3);
		assert_eq!(info.command_line, "sh -c");
		assert!(table.scan_for_completion().is_empty());
	}

	#[test]
	fn terminate_kills_running_job() {
		let table = JobTable::new();
		let id = table.create_job(&ctx("sleep 30"), spawn("exec sleep 30"), None, None);
		assert!(table.set_priority(id, PriorityClass::Idle));
		assert!(table.terminate(id));
		assert_eq!(table.wait(id).unwrap(), 128 + Signal::SIGKILL as i32);
		assert!(!table.terminate(id));
		assert!(!table.set_priority(id, PriorityClass::Normal));
	}

	#[test]
	fn unknown_ids_are_rejected() {
		let table = JobTable::new();
		assert_eq!(table.job_information(42), Err(JobError::NotFound(42)));
		assert_eq!(table.wait(42), Err(JobError::NotFound(42)));
		assert_eq!(table.output(42), Err(JobError::NotFound(42)));
		assert!(!table.terminate(42));
		assert!(!table.set_priority(42, PriorityClass::High));
	}

	#[test]
	fn output_is_collected_once_completed() {
		let table = JobTable::new();
		let (read, write) = create_pipe().unwrap();
		let buffer = ProcessBuffer::new(read).unwrap();
		let child = Command::new("sh")
			.arg("-c")
			.arg("echo captured")
			.stdout(Stdio::from(write))
			.spawn()
			.unwrap();
		let id = table.create_job(&ctx("echo captured"), Pid::from_raw(child.id() as i32), Some(buffer.clone()), None);
		assert!(table.job_information(id).unwrap().has_output);
		assert_eq!(table.wait(id).unwrap(), 0);
		let (out, err) = table.output(id).unwrap();
		assert_eq!(out, b"captured\n".to_vec());
		assert!(err.is_empty());

		let mut piped = Vec::new();
		table.pipe_output(id, Some(&mut piped), None).unwrap();
		assert_eq!(piped, b"captured\n".to_vec());
		assert_eq!(table.collect_garbage(), 1);
	}

	#[test]
	fn output_right_after_exit_is_complete() {
		let table = JobTable::new();
		for _ in 0..50 {
			let (read, write) = create_pipe().unwrap();
			let buffer = ProcessBuffer::new(read).unwrap();
			let child = Command::new("sh")
				.arg("-c")
				.arg("echo captured")
				.stdout(Stdio::from(write))
				.spawn()
				.unwrap();
			let id = table.create_job(&ctx("echo captured"), Pid::from_raw(child.id() as i32), Some(buffer), None);
			assert_eq!(table.wait(id).unwrap(), 0);
			let (out, _) = table.output(id).unwrap();
			assert_eq!(out, b"captured\n".to_vec());
		}
		assert_eq!(table.collect_garbage(), 50);
	}

	#[test]
	fn output_of_running_job_is_refused() {
		let table = JobTable::new();
		let id = table.create_job(&ctx("sleep"), spawn("exec sleep 30"), None, None);
		assert_eq!(table.output(id), Err(JobError::StillRunning(id)));
		table.terminate(id);
		table.wait(id).unwrap();
		assert_eq!(table.output(id), Err(JobError::NoOutput(id)));
	}

	#[test]
	fn priority_classes_parse_case_insensitively() {
		assert_eq!("High".parse::<PriorityClass>(), Ok(PriorityClass::High));
		assert_eq!("BELOWNORMAL".parse::<PriorityClass>(), Ok(PriorityClass::BelowNormal));
		assert!("urgent".parse::<PriorityClass>().is_err());
		assert_eq!(PriorityClass::AboveNormal.to_string(), "abovenormal");
	}
}
