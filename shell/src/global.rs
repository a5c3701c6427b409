use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use crate::builtin::BuiltinTable;
use crate::job::{JobId, JobTable, NO_JOB};
use crate::redirect::{Ambient, StdHandles};
use crate::search;

pub struct State {
	pub search_cache: search::SearchCache,
	pub jobs: Arc<JobTable>,
	pub builtins: Arc<BuiltinTable>,
	/// Standard handles builtins use; redirected around each builtin call.
	pub io: StdHandles,
	/// Working directory for spawned programs and relative redirections.
	pub cwd: PathBuf,
	/// Directories saved by `pushd`, most recent last.
	pub dir_stack: Vec<PathBuf>,
	pub last_exit_code: i32,
	pub last_job_id: JobId,
	pub exit_requested: Option<i32>,
}

impl Default for State {
	fn default() -> State {
		State::new()
	}
}

impl State {
	pub fn new() -> State {
		State::with_builtins(Arc::new(BuiltinTable::with_defaults()))
	}

	pub fn with_builtins(builtins: Arc<BuiltinTable>) -> State {
		let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
		State {
			search_cache: search::SearchCache::new(),
			jobs: Arc::new(JobTable::new()),
			builtins,
			io: StdHandles::process(),
			cwd,
			dir_stack: Vec::new(),
			last_exit_code: 0,
			last_job_id: NO_JOB,
			exit_requested: None,
		}
	}
}

impl Ambient for State {
	fn ambient_mut(&mut self) -> &mut StdHandles {
		&mut self.io
	}
}
