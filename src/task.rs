//! Task runtime: the verify/run lifecycle, memoisation, return-type
//! enforcement, the task registry, and the Package proxy (spec §4.4, §4.6).

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    argument::{bind_arguments, ArgType, ArgumentDecl, Parameters, Value},
    context::Context,
    error::{CrewError, Result},
    logger,
    template::Template,
};

/// A named, idempotent unit of work. Implementors declare their argument
/// list and an optional `verify` capability; the runtime (`invoke_task`)
/// drives the verify/run/re-verify cycle described in spec §4.6.
#[async_trait]
pub trait BaseTask: Send + Sync {
    /// Fully-qualified dotted name, e.g. `fs.digests.sha256`.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn args(&self) -> &[ArgumentDecl];

    fn return_type(&self) -> Option<ArgType> {
        None
    }

    fn memoize(&self) -> bool {
        false
    }

    fn nodoc(&self) -> bool {
        false
    }

    /// Whether this task declares a `verify` entry point. The runtime checks
    /// capability presence rather than trait-method existence (spec §9).
    fn has_verify(&self) -> bool {
        false
    }

    async fn verify(&self, _ctx: Context, _params: Parameters) -> Result<Value> {
        unreachable!("BaseTask::verify called on a task with has_verify() == false")
    }

    async fn run(&self, ctx: Context, params: Parameters) -> Result<Value>;

    /// Directory a task body's files/templates are resolved relative to.
    /// Defaults to the process's current directory; a task backed by a
    /// bundled directory of assets overrides this.
    fn source_dir(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_default()
    }

    /// Resolves `rel` against [`BaseTask::source_dir`], the analog of the
    /// original's `task_file` helper.
    fn task_file(&self, rel: &Path) -> PathBuf {
        self.source_dir().join(rel)
    }

    /// Binds a template name under [`BaseTask::source_dir`] for rendering.
    fn template(&self, name: &str) -> Template {
        Template::resolve(self.source_dir(), name)
    }
}

/// Drives the full invoke lifecycle (spec §4.6): memoisation short-circuit,
/// a task logging scope, the verify/run/re-verify cycle, and return-type
/// enforcement.
pub async fn invoke_task(
    task: Arc<dyn BaseTask>,
    ctx: Context,
    positional: Vec<Value>,
    keyword: HashMap<String, Value>,
) -> Result<Value> {
    let params = bind_arguments(task.args(), positional, keyword)?;
    let cache_key = task.name().to_owned();
    if task.memoize() {
        if let Some(cached) = ctx.cache_get(&cache_key) {
            return Ok(cached);
        }
    }
    let mut scope = logger::open_task_scope(&ctx.descriptor(), task.name(), &params);
    let outcome = run_lifecycle(task.as_ref(), &ctx, &params).await;
    if outcome.is_ok() {
        scope.succeed();
    }
    let value = outcome?;
    if let Some(expected) = task.return_type() {
        if !value.is_null() && !expected.value_matches(&value) {
            return Err(CrewError::ReturnTypeMismatch(format!(
                "{} does not match declared return type {expected:?}",
                value.type_name()
            )));
        }
    }
    if task.memoize() {
        ctx.cache_put(cache_key, value.clone());
    }
    Ok(value)
}

async fn run_lifecycle(task: &dyn BaseTask, ctx: &Context, params: &Parameters) -> Result<Value> {
    if !task.has_verify() {
        return task.run(ctx.clone(), params.clone()).await;
    }
    match task.verify(ctx.clone(), params.clone()).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_assertion() => {
            task.run(ctx.clone(), params.clone()).await?;
            match task.verify(ctx.clone(), params.clone()).await {
                Ok(value) => Ok(value),
                Err(e2) if e2.is_assertion() => {
                    Err(CrewError::TaskFailureError(e2.to_string()))
                }
                Err(e2) => Err(e2),
            }
        }
        Err(e) => Err(e),
    }
}

/// An async check bound to a context, associated with one task by name.
#[derive(Clone)]
pub struct TaskTest {
    pub name: String,
    /// Stamped by [`StaticTaskDirectory::register_test`] with the task this
    /// test belongs to, so `run` can open a properly labelled test scope.
    task_name: String,
    check: Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>,
}

impl TaskTest {
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            task_name: String::new(),
            check: Arc::new(move |ctx| Box::pin(check(ctx))),
        }
    }

    pub async fn run(&self, ctx: Context) -> Result<()> {
        let mut scope = logger::open_test_scope(&self.task_name, &self.name, &ctx.descriptor());
        let result = (self.check)(ctx).await;
        if result.is_ok() {
            scope.succeed();
        }
        result
    }
}

/// The task-library discovery collaborator boundary (spec §6). How the
/// directory is materialised (filesystem scan, embedded bundle, ...) is an
/// external concern; this crate ships one concrete implementation,
/// [`StaticTaskDirectory`], standing in for all of them.
pub trait TaskDirectory: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Arc<dyn BaseTask>>;
    fn tests(&self, name: &str) -> Vec<TaskTest>;
    fn has(&self, name: &str) -> bool;
    /// Lexicographic traversal of every registered task.
    fn iterate(&self) -> Vec<Arc<dyn BaseTask>>;
}

/// An in-memory `HashMap`-backed task registry populated by [`register`].
#[derive(Default)]
pub struct StaticTaskDirectory {
    tasks: HashMap<String, Arc<dyn BaseTask>>,
    tests: HashMap<String, Vec<TaskTest>>,
}

impl StaticTaskDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Arc<dyn BaseTask>) {
        self.tasks.insert(task.name().to_owned(), task);
    }

    pub fn register_test(&mut self, task_name: impl Into<String>, mut test: TaskTest) {
        let task_name = task_name.into();
        test.task_name = task_name.clone();
        self.tests.entry(task_name).or_default().push(test);
    }
}

impl TaskDirectory for StaticTaskDirectory {
    fn resolve(&self, name: &str) -> Result<Arc<dyn BaseTask>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| CrewError::Transport(format!("no such task: {name}")))
    }

    fn tests(&self, name: &str) -> Vec<TaskTest> {
        self.tests.get(name).cloned().unwrap_or_default()
    }

    fn has(&self, name: &str) -> bool {
        let prefix = format!("{name}.");
        self.tasks.contains_key(name) || self.tasks.keys().any(|k| k.starts_with(&prefix))
    }

    fn iterate(&self) -> Vec<Arc<dyn BaseTask>> {
        let mut names: Vec<&String> = self.tasks.keys().collect();
        names.sort();
        names.into_iter().map(|n| self.tasks[n].clone()).collect()
    }
}

/// A chainable dotted-name accessor over a `TaskDirectory`, bound to one
/// context. `ctx.pkg("fs").pkg("write").call(args)` mirrors the original's
/// dynamic `self.fs.write(...)` attribute dispatch (spec §9).
#[derive(Clone)]
pub struct Package {
    ctx: Context,
    directory: Arc<dyn TaskDirectory>,
    prefix: String,
}

impl Package {
    pub fn new(ctx: Context, directory: Arc<dyn TaskDirectory>) -> Self {
        Self { ctx, directory, prefix: String::new() }
    }

    /// Extends the accumulated dotted prefix.
    pub fn pkg(&self, name: &str) -> Package {
        let prefix = if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{name}", self.prefix)
        };
        Package { ctx: self.ctx.clone(), directory: Arc::clone(&self.directory), prefix }
    }

    /// Resolves the accumulated prefix to a task, binds it to this
    /// package's context, and invokes it.
    pub async fn call(&self, positional: Vec<Value>) -> Result<Value> {
        self.call_with(positional, HashMap::new()).await
    }

    pub async fn call_with(
        &self,
        positional: Vec<Value>,
        keyword: HashMap<String, Value>,
    ) -> Result<Value> {
        let task = self.directory.resolve(&self.prefix)?;
        invoke_task(task, self.ctx.clone(), positional, keyword).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::ArgType;

    struct CountingTask {
        counter: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl BaseTask for CountingTask {
        fn name(&self) -> &str {
            "test.counter"
        }

        fn args(&self) -> &[ArgumentDecl] {
            &[]
        }

        fn memoize(&self) -> bool {
            true
        }

        async fn run(&self, _ctx: Context, _params: Parameters) -> Result<Value> {
            self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn memoized_task_runs_once_per_context() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let task: Arc<dyn BaseTask> = Arc::new(CountingTask { counter: counter.clone() });
        let ctx = Context::local();
        invoke_task(task.clone(), ctx.clone(), vec![], HashMap::new()).await.unwrap();
        invoke_task(task.clone(), ctx.clone(), vec![], HashMap::new()).await.unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    struct VerifyThenRun {
        satisfied: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl BaseTask for VerifyThenRun {
        fn name(&self) -> &str {
            "test.verify_then_run"
        }
        fn args(&self) -> &[ArgumentDecl] {
            &[]
        }
        fn has_verify(&self) -> bool {
            true
        }
        async fn verify(&self, _ctx: Context, _params: Parameters) -> Result<Value> {
            if self.satisfied.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(Value::Null)
            } else {
                Err(CrewError::AssertionFailure("not yet satisfied".into()))
            }
        }
        async fn run(&self, _ctx: Context, _params: Parameters) -> Result<Value> {
            self.satisfied.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn verify_succeeding_skips_run() {
        let satisfied = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let task: Arc<dyn BaseTask> = Arc::new(VerifyThenRun { satisfied });
        let ctx = Context::local();
        invoke_task(task, ctx, vec![], HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_failing_then_run_then_reverify_converges() {
        let satisfied = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let task: Arc<dyn BaseTask> = Arc::new(VerifyThenRun { satisfied });
        let ctx = Context::local();
        invoke_task(task, ctx, vec![], HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn registered_test_is_stamped_with_its_task_name_and_runs() {
        let mut directory = StaticTaskDirectory::new();
        directory.register_test(
            "fs.write",
            TaskTest::new("round_trips", |ctx| async move {
                let _ = ctx;
                Ok(())
            }),
        );
        let tests = directory.tests("fs.write");
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].task_name, "fs.write");
        tests[0].run(Context::local()).await.unwrap();
    }

    #[tokio::test]
    async fn a_failing_test_propagates_its_error() {
        let mut directory = StaticTaskDirectory::new();
        directory.register_test(
            "fs.write",
            TaskTest::new("always_fails", |_ctx| async {
                Err(CrewError::AssertionFailure("nope".into()))
            }),
        );
        let tests = directory.tests("fs.write");
        assert!(tests[0].run(Context::local()).await.is_err());
    }

    struct FileAwareTask {
        source_dir: std::path::PathBuf,
    }

    #[async_trait]
    impl BaseTask for FileAwareTask {
        fn name(&self) -> &str {
            "test.file_aware"
        }

        fn args(&self) -> &[ArgumentDecl] {
            &[]
        }

        fn source_dir(&self) -> std::path::PathBuf {
            self.source_dir.clone()
        }

        async fn run(&self, _ctx: Context, _params: Parameters) -> Result<Value> {
            let path = self.task_file(Path::new("payload.txt"));
            let contents = std::fs::read_to_string(&path).map_err(CrewError::from)?;
            Ok(Value::from(contents))
        }
    }

    #[tokio::test]
    async fn task_file_resolves_relative_to_source_dir() {
        let dir = std::env::temp_dir().join(format!("crewctl-task-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("payload.txt"), "payload contents").unwrap();
        let task: Arc<dyn BaseTask> = Arc::new(FileAwareTask { source_dir: dir });
        let result = invoke_task(task, Context::local(), vec![], HashMap::new()).await.unwrap();
        assert_eq!(result, Value::from("payload contents"));
    }

    struct TemplateAwareTask {
        source_dir: std::path::PathBuf,
    }

    #[async_trait]
    impl BaseTask for TemplateAwareTask {
        fn name(&self) -> &str {
            "test.template_aware"
        }

        fn args(&self) -> &[ArgumentDecl] {
            &[]
        }

        fn source_dir(&self) -> std::path::PathBuf {
            self.source_dir.clone()
        }

        async fn run(&self, _ctx: Context, _params: Parameters) -> Result<Value> {
            let mut vars = HashMap::new();
            vars.insert("name".to_owned(), Value::from("crewctl"));
            let bytes = self.template("greeting.txt").render_as_bytes(vars).await?;
            Ok(Value::from(String::from_utf8(bytes).unwrap()))
        }
    }

    #[tokio::test]
    async fn template_resolves_relative_to_source_dir() {
        let dir = std::env::temp_dir().join(format!("crewctl-task-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("greeting.txt"), "hello, {{ name }}").unwrap();
        let task: Arc<dyn BaseTask> = Arc::new(TemplateAwareTask { source_dir: dir });
        let result = invoke_task(task, Context::local(), vec![], HashMap::new()).await.unwrap();
        assert_eq!(result, Value::from("hello, crewctl"));
    }
}
