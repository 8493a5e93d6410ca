use std::sync::atomic::{AtomicBool, Ordering};

use stacked_errors::{Result, StackableErr};
use tokio::{fs::File, io::AsyncWriteExt};

use crate::Command;

/// Set when a `SIGINT` (Ctrl-C) is observed. Checked cooperatively by the
/// [`Executor`](crate::Executor) join loop and other long-running loops.
pub static CTRLC_ISSUED: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide Ctrl-C handler. Call once, at process start.
pub fn install_ctrlc_handler() -> Result<()> {
    ctrlc::set_handler(move || {
        CTRLC_ISSUED.store(true, Ordering::SeqCst);
    })
    .stack_err_locationless("install_ctrlc_handler")
}

/// Returns if `CTRLC_ISSUED` has been set, and resets it to `false`
pub fn ctrlc_issued_reset() -> bool {
    CTRLC_ISSUED.swap(false, Ordering::SeqCst)
}

/// Runs a command to completion and asserts it was successful. Equivalent to
/// `Command::new(cmd_with_args).run_to_completion().await?.assert_success()`.
pub async fn sh(cmd_with_args: impl AsRef<str>) -> Result<()> {
    Command::new(cmd_with_args)
        .run_to_completion()
        .await
        .stack_err_locationless("sh")?
        .assert_success()
}

/// Flushes and `sync_all`s a file so that changes are visible to other
/// processes reading the same path.
pub async fn close_file(mut file: File) -> Result<()> {
    file.flush().await.stack_err_locationless("close_file")?;
    file.sync_all().await.stack_err_locationless("close_file")?;
    Ok(())
}
