pub mod buffer;
pub mod builtin;
pub mod config;
pub mod error;
pub mod eval;
pub mod global;
pub mod job;
pub mod parser;
pub mod plan;
pub mod redirect;
pub mod search;
pub mod types;


pub use buffer::ProcessBuffer;
pub use builtin::{BuiltinFn, BuiltinTable};
pub use config::ShellConfig;
pub use error::ExecError;
pub use eval::{execute_builtin, execute_expression, execute_plan};
pub use global::State;
pub use job::{JobId, JobTable, NO_JOB};
pub use plan::{build_exec_context, build_plan};
