//! An agentless, multi-target command orchestrator: declare tasks against an
//! abstract execution [`Context`](context::Context) (local host, SSH host,
//! or Docker container), fan them out across a [`Provider`](provider::Provider)-yielded
//! sequence of contexts with a bounded [`Executor`](executor::Executor), and
//! collect a structured pass/fail/error outcome per context.
//!
//! The module layout separates low-level OS process plumbing (`command`,
//! `command_runner`,
//! `paths`, `file_options`, `misc`) underneath the orchestration-specific
//! layers (`argument`, `logger`, `context`, `file_ref`, `provider`,
//! `executor`, `task`, `template`, `app`, `tasks`).

mod app;
mod argument;
mod command;
mod command_runner;
mod context;
mod error;
mod executor;
mod file_options;
mod file_ref;
mod logger;
mod misc;
mod paths;
mod provider;
mod task;
mod tasks;
mod template;

pub use app::App;
pub use argument::{bind_arguments, ArgType, ArgumentDecl, Parameters, Value};
pub use command::{Command, CommandResult, CommandResultNoDebug};
pub(crate) use command_runner::{command_runner, CommandRunner};
pub use context::{esc, Context, SshAuth};
pub use error::{CrewError, Result};
pub use executor::{Bucket, ExecutionResult, Executor, ResultsList};
pub use file_options::{FileOptions, ReadOrWrite, WriteOptions};
pub use file_ref::{CopyOptions, FileRef};
pub use misc::{close_file, ctrlc_issued_reset, install_ctrlc_handler, sh, CTRLC_ISSUED};
pub use paths::{acquire_dir_path, acquire_file_path, expand_tilde};
pub use provider::{DockerProvider, LocalProvider, Provider, SshProvider, TunnelSpec};
pub use task::{invoke_task, BaseTask, Package, StaticTaskDirectory, TaskDirectory, TaskTest};
pub use tasks::{demo_directory, FsDigestMd5, FsDigestSha256, FsRead, FsStat, FsWrite};
pub use template::Template;
