use std::io::{self, BufRead, Write};

use anyhow::Context;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use ish::{execute_expression, ShellConfig, State};

fn init_logging(config: &ShellConfig) {
	let filter = EnvFilter::try_new(config.effective_log_filter()).unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.with_target(false)
		.init();
}

fn report_completed_jobs(state: &State) {
	for id in state.jobs.scan_for_completion() {
		if let Ok(info) = state.jobs.job_information(id) {
			let _ = writeln!(state.io.stderr(), "job {} completed: {}", id, info.command_line);
		}
	}
}

fn main() -> anyhow::Result<()> {
	let config = match ShellConfig::load() {
		Ok(config) => config,
		Err(e) => {
			eprintln!("ish: {}; using defaults", e);
			ShellConfig::default()
		},
	};
	init_logging(&config);

	let mut state = State::new();
	let stdin = io::stdin();
	let mut stdin_locked = stdin.lock();
	let mut line = String::new();
	loop {
		if config.report_job_completion {
			report_completed_jobs(&state);
		}
		{
			let mut stdout = state.io.stdout();
			stdout.write_all(config.prompt.as_bytes()).context("cannot write prompt")?;
			stdout.flush().context("cannot write prompt")?;
		}

		line.clear();
		match stdin_locked.read_line(&mut line) {
			Ok(0) => break,
			Ok(_) => {},
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => {
				warn!(error = %e, "cannot read input");
				break;
			},
		}

		let code = execute_expression(&mut state, line.trim_end_matches(['\n', '\r']));
		debug!(code, "line finished");
		if let Some(code) = state.exit_requested {
			std::process::exit(code);
		}
	}
	std::process::exit(state.last_exit_code)
}
