use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stacked_errors::{Result, StackableErr};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{acquire_dir_path, acquire_file_path, close_file};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WriteOptions {
    // creates file if nonexistent
    create: bool,
    // truncation by default, append otherwise
    append: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ReadOrWrite {
    Read,
    Write(WriteOptions),
}

/// A wrapper combining capabilities from `tokio::fs::{OpenOptions, File}` with
/// a lot of opinionated defaults and `close_file`. Used directly by the
/// template renderer and the `fs` demo tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOptions {
    pub path: PathBuf,
    pub options: ReadOrWrite,
}

impl FileOptions {
    pub fn read(file_path: impl Into<PathBuf>) -> Self {
        Self {
            path: file_path.into(),
            options: ReadOrWrite::Read,
        }
    }

    /// Sets `create` to true and `append` to false by default
    pub fn write(file_path: impl Into<PathBuf>) -> Self {
        Self {
            path: file_path.into(),
            options: ReadOrWrite::Write(WriteOptions {
                create: true,
                append: false,
            }),
        }
    }

    /// Checks only for existence of the directory and file (allowing the file
    /// to not exist if `create` is not true). Returns the combined path if
    /// `!create`, else returns the directory.
    pub async fn preacquire(&self) -> Result<PathBuf> {
        let dir = self
            .path
            .parent()
            .stack_err_with_locationless(|| "FileOptions::preacquire() -> empty path")?;
        let dir_path = acquire_dir_path(dir).await.stack_err_with_locationless(|| {
            format!("{self:?}.preacquire() could not acquire directory")
        })?;
        match self.options {
            ReadOrWrite::Read => (),
            ReadOrWrite::Write(WriteOptions { create, .. }) => {
                if create {
                    return Ok(dir_path);
                }
            }
        }
        let mut combined = dir_path;
        combined.push(self.path.file_name().stack_err_with_locationless(|| {
            "FileOptions::preacquire() -> path has no file name component"
        })?);
        acquire_file_path(&combined).await.stack_err_with_locationless(|| {
            format!("{self:?}.preacquire() could not acquire combined directory and file name")
        })
    }

    pub async fn acquire_file(&self) -> Result<File> {
        let preacquired = self
            .preacquire()
            .await
            .stack_err_locationless("FileOptions::acquire_file()")?;
        // for a creatable write, `preacquire` only checked the parent
        // directory exists (the file itself may not yet), so join the file
        // name back on; otherwise `preacquire` already resolved the full path
        let path = match self.options {
            ReadOrWrite::Write(WriteOptions { create: true, .. }) => {
                let mut p = preacquired;
                p.push(self.path.file_name().stack_err_with_locationless(|| {
                    "FileOptions::acquire_file() -> path has no file name component"
                })?);
                p
            }
            _ => preacquired,
        };
        Ok(match self.options {
            ReadOrWrite::Read => OpenOptions::new()
                .read(true)
                .open(&path)
                .await
                .stack_err_with_locationless(|| format!("{self:?}.acquire_file()"))?,
            ReadOrWrite::Write(WriteOptions { create, append }) => OpenOptions::new()
                .write(true)
                .create(create)
                .truncate(!append)
                .append(append)
                .open(&path)
                .await
                .stack_err_with_locationless(|| format!("{self:?}.acquire_file()"))?,
        })
    }

    pub async fn read_to_string(file_path: impl Into<PathBuf>) -> Result<String> {
        let mut file = Self::read(file_path)
            .acquire_file()
            .await
            .stack_err_locationless("read_to_string")?;
        let mut s = String::new();
        file.read_to_string(&mut s).await.stack_err_locationless("read_to_string")?;
        Ok(s)
    }

    pub async fn write_str(file_path: impl Into<PathBuf>, s: &str) -> Result<()> {
        let mut file = Self::write(file_path)
            .acquire_file()
            .await
            .stack_err_locationless("write_str")?;
        file.write_all(s.as_bytes())
            .await
            .stack_err_locationless("write_str")?;
        close_file(file).await.stack_err_locationless("write_str")
    }
}
