use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::{env, fs, io};

use tracing::debug;

pub struct SearchCache {
	imp: HashMap<OsString, PathBuf>,
}

const PATH_KEY: &str = "PATH";

impl Default for SearchCache {
	fn default() -> SearchCache {
		SearchCache::new()
	}
}

impl SearchCache {
	pub fn new() -> SearchCache {
		let mut this = SearchCache { imp: HashMap::new() };
		this.rehash();
		this
	}

	fn add_entry(&mut self, entry: io::Result<fs::DirEntry>) -> io::Result<()> {
		let e = entry?;
		if e.file_type()?.is_dir() {
			return Ok(());
		}
		self.imp.entry(e.file_name()).or_insert_with(|| e.path());
		Ok(())
	}

	/// Rebuilds the cache from the current `PATH`. Earlier directories win.
	pub fn rehash(&mut self) {
		let path = env::var_os(PATH_KEY).unwrap_or_default();
		self.rehash_from(&path);
	}

	pub fn rehash_from(&mut self, path: &OsStr) {
		self.imp.clear();
		for dir in env::split_paths(path) {
			if let Ok(entries) = fs::read_dir(dir) {
				for entry in entries {
					let _ = self.add_entry(entry);
				}
			}
		}
		debug!(programs = self.imp.len(), "rehashed search path");
	}

	pub fn lookup(&self, name: &str) -> Option<&Path> {
		self.imp.get(OsStr::new(name)).map(PathBuf::as_path)
	}

	/// Finds the program a stage names. Names with a `/` are taken relative
	/// to `cwd` instead of being searched for.
	pub fn resolve(&self, name: &str, cwd: &Path) -> Option<PathBuf> {
		if name.contains('/') {
			let path = cwd.join(name);
			return if path.is_file() { Some(path) } else { None };
		}
		self.lookup(name).map(Path::to_path_buf)
	}
}
