//! A small set of illustrative task implementations, grounded in
//! `original_source/crew/tasks/fs/{write,read,stat}.py` and
//! `.../fs/digests/{md5,sha256}.py`. These are worked examples and test
//! fixtures, not an exhaustive task library (spec §1 Non-goals).

use async_trait::async_trait;

use crate::{
    argument::{ArgType, ArgumentDecl, Parameters, Value},
    context::Context,
    error::{CrewError, Result},
    task::BaseTask,
};

fn path_arg(params: &Parameters) -> Result<&str> {
    params.str("path").ok_or_else(|| CrewError::MissingArgument("path".into()))
}

/// Writes `content` to `path`, converging via the verify/run cycle: `verify`
/// checks the file already has the desired content, `run` writes it.
pub struct FsWrite {
    args: Vec<ArgumentDecl>,
}

impl Default for FsWrite {
    fn default() -> Self {
        Self {
            args: vec![
                ArgumentDecl::new("path", ArgType::Str).description("destination path"),
                ArgumentDecl::new("content", ArgType::Bytes).description("file content"),
            ],
        }
    }
}

#[async_trait]
impl BaseTask for FsWrite {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn args(&self) -> &[ArgumentDecl] {
        &self.args
    }

    fn has_verify(&self) -> bool {
        true
    }

    async fn verify(&self, _ctx: Context, params: Parameters) -> Result<Value> {
        let path = path_arg(&params)?;
        let content = match params.get("content") {
            Some(Value::Bytes(b)) => b.clone(),
            _ => return Err(CrewError::MissingArgument("content".into())),
        };
        let existing = crate::file_options::FileOptions::read_to_string(path)
            .await
            .map_err(|_| CrewError::AssertionFailure(format!("{path} does not exist or is unreadable")))?;
        if existing.into_bytes() == content {
            Ok(Value::Null)
        } else {
            Err(CrewError::AssertionFailure(format!("{path} does not have the desired content")))
        }
    }

    async fn run(&self, _ctx: Context, params: Parameters) -> Result<Value> {
        let path = path_arg(&params)?;
        let content = match params.get("content") {
            Some(Value::Bytes(b)) => b.clone(),
            _ => return Err(CrewError::MissingArgument("content".into())),
        };
        crate::file_options::FileOptions::write_str(path, &String::from_utf8_lossy(&content))
            .await
            .map_err(CrewError::from)?;
        Ok(Value::Null)
    }
}

/// Reads a file's raw bytes back. Demonstrates the binary round-trip
/// property from spec §8 scenario 5 (non-UTF-8 content still comes back
/// byte-for-byte, surfaced through the outcome wire format as base64).
#[derive(Default)]
pub struct FsRead {
    args: Vec<ArgumentDecl>,
}

impl FsRead {
    pub fn new() -> Self {
        Self { args: vec![ArgumentDecl::new("path", ArgType::Str)] }
    }
}

#[async_trait]
impl BaseTask for FsRead {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn args(&self) -> &[ArgumentDecl] {
        &self.args
    }

    fn return_type(&self) -> Option<ArgType> {
        Some(ArgType::Bytes)
    }

    async fn run(&self, ctx: Context, params: Parameters) -> Result<Value> {
        let path = path_arg(&params)?;
        let out = ctx.sh(&format!("cat {}", crate::context::esc(path))).await?;
        Ok(Value::Bytes(out.into_bytes()))
    }
}

/// `stat`'s existence check, used by `FsWrite::verify` style tasks that need
/// to know whether a path exists without reading its content.
#[derive(Default)]
pub struct FsStat {
    args: Vec<ArgumentDecl>,
}

impl FsStat {
    pub fn new() -> Self {
        Self { args: vec![ArgumentDecl::new("path", ArgType::Str)] }
    }
}

#[async_trait]
impl BaseTask for FsStat {
    fn name(&self) -> &str {
        "fs.stat"
    }

    fn args(&self) -> &[ArgumentDecl] {
        &self.args
    }

    fn return_type(&self) -> Option<ArgType> {
        Some(ArgType::Bool)
    }

    async fn run(&self, ctx: Context, params: Parameters) -> Result<Value> {
        let path = path_arg(&params)?;
        let exists = ctx.sh_ok(&format!("test -e {}", crate::context::esc(path))).await?;
        Ok(Value::Bool(exists))
    }
}

/// Computes a file's SHA-256 digest, grounded in
/// `original_source/crew/tasks/fs/digests/sha256.py`.
#[derive(Default)]
pub struct FsDigestSha256 {
    args: Vec<ArgumentDecl>,
}

impl FsDigestSha256 {
    pub fn new() -> Self {
        Self { args: vec![ArgumentDecl::new("path", ArgType::Str)] }
    }
}

#[async_trait]
impl BaseTask for FsDigestSha256 {
    fn name(&self) -> &str {
        "fs.digests.sha256"
    }

    fn args(&self) -> &[ArgumentDecl] {
        &self.args
    }

    fn return_type(&self) -> Option<ArgType> {
        Some(ArgType::Str)
    }

    async fn run(&self, _ctx: Context, params: Parameters) -> Result<Value> {
        use sha2::{Digest, Sha256};
        let path = path_arg(&params)?;
        let bytes = crate::file_options::FileOptions::read_to_string(path)
            .await
            .map_err(CrewError::from)?;
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_bytes());
        Ok(Value::Str(format!("{:x}", hasher.finalize())))
    }
}

/// Computes a file's MD5 digest, grounded in
/// `original_source/crew/tasks/fs/digests/md5.py`. Kept around mainly as a
/// worked example of a second digest task sharing the same shape as
/// [`FsDigestSha256`].
#[derive(Default)]
pub struct FsDigestMd5 {
    args: Vec<ArgumentDecl>,
}

impl FsDigestMd5 {
    pub fn new() -> Self {
        Self { args: vec![ArgumentDecl::new("path", ArgType::Str)] }
    }
}

#[async_trait]
impl BaseTask for FsDigestMd5 {
    fn name(&self) -> &str {
        "fs.digests.md5"
    }

    fn args(&self) -> &[ArgumentDecl] {
        &self.args
    }

    fn return_type(&self) -> Option<ArgType> {
        Some(ArgType::Str)
    }

    async fn run(&self, _ctx: Context, params: Parameters) -> Result<Value> {
        use md5::{Digest, Md5};
        let path = path_arg(&params)?;
        let bytes = crate::file_options::FileOptions::read_to_string(path)
            .await
            .map_err(CrewError::from)?;
        let mut hasher = Md5::new();
        hasher.update(bytes.as_bytes());
        Ok(Value::Str(format!("{:x}", hasher.finalize())))
    }
}

/// Registers the demo task set into a fresh directory, for examples and
/// integration tests.
pub fn demo_directory() -> crate::task::StaticTaskDirectory {
    let mut directory = crate::task::StaticTaskDirectory::new();
    directory.register(std::sync::Arc::new(FsWrite::default()));
    directory.register(std::sync::Arc::new(FsRead::new()));
    directory.register(std::sync::Arc::new(FsStat::new()));
    directory.register(std::sync::Arc::new(FsDigestSha256::new()));
    directory.register(std::sync::Arc::new(FsDigestMd5::new()));
    directory
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::invoke_task;
    use std::{collections::HashMap, sync::Arc};

    #[tokio::test]
    async fn verify_run_reverify_cycle_writes_file() {
        let path = std::env::temp_dir().join(format!("crewctl-fswrite-{}", uuid::Uuid::new_v4()));
        let task: Arc<dyn BaseTask> = Arc::new(FsWrite::default());
        let ctx = Context::local();
        let result = invoke_task(
            task,
            ctx,
            vec![
                Value::Str(path.to_string_lossy().into_owned()),
                Value::Bytes(b"abc".to_vec()),
            ],
            HashMap::new(),
        )
        .await;
        assert!(result.is_ok());
        let written = crate::file_options::FileOptions::read_to_string(&path).await.unwrap();
        assert_eq!(written, "abc");
    }

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let path = std::env::temp_dir().join(format!("crewctl-sha-{}", uuid::Uuid::new_v4()));
        crate::file_options::FileOptions::write_str(&path, "abc").await.unwrap();
        let task: Arc<dyn BaseTask> = Arc::new(FsDigestSha256::new());
        let result =
            invoke_task(task, Context::local(), vec![Value::Str(path.to_string_lossy().into_owned())], HashMap::new())
                .await
                .unwrap();
        assert_eq!(
            result,
            Value::Str("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_owned())
        );
    }
}
