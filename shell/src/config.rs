use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::Deserialize;

use crate::error::ConfigError;

const CONFIG_ENV: &str = "ISH_CONFIG";
/// Overrides `log_filter` when set.
pub const LOG_ENV: &str = "ISH_LOG";

/// Settings of the interactive shell, read from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
	pub prompt: String,
	/// `tracing_subscriber::EnvFilter` directives.
	pub log_filter: String,
	/// Print a line before the prompt when a background job finishes.
	pub report_job_completion: bool,
}

impl Default for ShellConfig {
	fn default() -> ShellConfig {
		ShellConfig {
			prompt: "ish> ".to_string(),
			log_filter: "warn".to_string(),
			report_job_completion: true,
		}
	}
}

impl ShellConfig {
	/// `$ISH_CONFIG`, else `$HOME/.config/ish/config.toml`.
	pub fn default_path() -> Option<PathBuf> {
		if let Some(path) = env::var_os(CONFIG_ENV) {
			return Some(PathBuf::from(path));
		}
		env::var_os("HOME").map(|home| Path::new(&home).join(".config").join("ish").join("config.toml"))
	}

	pub fn from_toml_str(text: &str, path: &Path) -> Result<ShellConfig, ConfigError> {
		toml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
	}

	/// A missing file yields the defaults.
	pub fn load_from(path: &Path) -> Result<ShellConfig, ConfigError> {
		match fs::read_to_string(path) {
			Ok(text) => ShellConfig::from_toml_str(&text, path),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ShellConfig::default()),
			Err(source) => Err(ConfigError::Read { path: path.to_path_buf(), source }),
		}
	}

	pub fn load() -> Result<ShellConfig, ConfigError> {
		match ShellConfig::default_path() {
			Some(path) => ShellConfig::load_from(&path),
			None => Ok(ShellConfig::default()),
		}
	}

	pub fn effective_log_filter(&self) -> String {
		env::var(LOG_ENV).unwrap_or_else(|_| self.log_filter.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn missing_fields_take_defaults() {
		let config = ShellConfig::from_toml_str("prompt = \"$ \"\n", Path::new("c.toml")).unwrap();
		assert_eq!(config, ShellConfig { prompt: "$ ".to_string(), ..ShellConfig::default() });
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		assert_eq!(ShellConfig::load_from(&dir.path().join("none.toml")).unwrap(), ShellConfig::default());
	}

	#[test]
	fn malformed_file_names_its_path() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		fs::write(&path, "report_job_completion = \"sometimes\"\n").unwrap();
		let err = ShellConfig::load_from(&path).unwrap_err();
		assert!(matches!(err, ConfigError::Parse { path: ref p, .. } if p == &path));
	}

	#[test]
	fn full_file_is_read() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		fs::write(&path, "prompt = \"> \"\nlog_filter = \"ish=debug\"\nreport_job_completion = false\n").unwrap();
		let config = ShellConfig::load_from(&path).unwrap();
		assert_eq!(config.prompt, "> ");
		assert_eq!(config.log_filter, "ish=debug");
		assert!(!config.report_job_completion);
	}
}
