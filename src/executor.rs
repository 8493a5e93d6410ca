//! Bounded worker pool fanning tasks out across a provider's contexts
//! (spec §4.7).
//!
//! The original's bespoke `asyncio.Queue` worker loop becomes a
//! `tokio::sync::Semaphore` sized to the concurrency cap plus a
//! `tokio::task::JoinSet`, per the REDESIGN FLAGS note in spec §9. The
//! externally observable semantics are unchanged: at most `N` contexts
//! concurrently acquired, exactly one outcome per yielded context.

use std::sync::{atomic::Ordering, Arc};

use tokio::sync::Semaphore;

use crate::{
    argument::Value,
    context::Context,
    error::{CrewError, Result},
    misc::CTRLC_ISSUED,
    provider::Provider,
};

/// One outcome bucket per spec §3/§7.
#[derive(Debug, Clone, PartialEq)]
pub enum Bucket {
    Passed,
    Failed,
    Errored,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub context_descriptor: String,
    pub bucket: Bucket,
    pub result: Option<Value>,
    pub exception: Option<String>,
}

/// The full set of outcomes from one `run_task`/`invoke` call.
#[derive(Debug, Clone, Default)]
pub struct ResultsList {
    pub outcomes: Vec<ExecutionResult>,
}

impl ResultsList {
    pub fn passed(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.outcomes.iter().filter(|o| o.bucket == Bucket::Passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.outcomes.iter().filter(|o| o.bucket == Bucket::Failed)
    }

    pub fn errored(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.outcomes.iter().filter(|o| o.bucket == Bucket::Errored)
    }

    pub fn any_unsuccessful(&self) -> bool {
        self.outcomes.iter().any(|o| o.bucket != Bucket::Passed)
    }

    /// The machine-readable outcome wire format (spec §6): passed/failed/
    /// errored arrays of `{ context, result, exception }`.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let mut errored = Vec::new();
        for outcome in &self.outcomes {
            let entry = serde_json::json!({
                "context": outcome.context_descriptor,
                "result": outcome.result.as_ref().map(Value::to_wire_json),
                "exception": outcome.exception,
            });
            match outcome.bucket {
                Bucket::Passed => passed.push(entry),
                Bucket::Failed => failed.push(entry),
                Bucket::Errored => errored.push(entry),
            }
        }
        serde_json::json!({ "passed": passed, "failed": failed, "errored": errored })
    }
}

/// Fans a function out across a provider's contexts with a bounded worker
/// pool of capacity `cap` (default 100).
pub struct Executor {
    cap: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Executor {
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }

    /// Invokes `f` once per context yielded by `provider`, bounded by this
    /// executor's concurrency cap. Returns once the provider has been fully
    /// consumed and every spawned worker has reported an outcome.
    pub async fn invoke<F, Fut>(&self, provider: &mut dyn Provider, f: F) -> Result<ResultsList>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        provider.acquire()?;
        let contexts = provider.contexts()?;
        let semaphore = Arc::new(Semaphore::new(self.cap.max(1)));
        let f = Arc::new(f);
        let mut set = tokio::task::JoinSet::new();
        for ctx in contexts {
            let semaphore = Arc::clone(&semaphore);
            let f = Arc::clone(&f);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let descriptor = ctx.descriptor();
                match f(ctx.clone()).await {
                    Ok(value) => {
                        let _ = ctx.release().await;
                        ExecutionResult {
                            context_descriptor: descriptor,
                            bucket: Bucket::Passed,
                            result: Some(value),
                            exception: None,
                        }
                    }
                    Err(e) => {
                        let _ = ctx.release().await;
                        let bucket = if e.is_assertion() { Bucket::Failed } else { Bucket::Errored };
                        ExecutionResult {
                            context_descriptor: descriptor,
                            bucket,
                            result: None,
                            exception: Some(e.to_string()),
                        }
                    }
                }
            });
        }
        let mut results = ResultsList::default();
        let mut cancelled = false;
        loop {
            if CTRLC_ISSUED.load(Ordering::SeqCst) {
                cancelled = true;
                set.abort_all();
            }
            let joined = match tokio::time::timeout(
                std::time::Duration::from_millis(50),
                set.join_next(),
            )
            .await
            {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_elapsed) => continue,
            };
            match joined {
                Ok(outcome) => results.outcomes.push(outcome),
                Err(join_err) => {
                    if !join_err.is_cancelled() {
                        results.outcomes.push(ExecutionResult {
                            context_descriptor: "<unknown>".into(),
                            bucket: Bucket::Errored,
                            result: None,
                            exception: Some(CrewError::Transport(join_err.to_string()).to_string()),
                        });
                    }
                }
            }
        }
        provider.release()?;
        if cancelled {
            return Err(CrewError::Cancelled);
        }
        Ok(results)
    }

    /// Thin wrapper: invokes the given task with each yielded context.
    pub async fn run_task(
        &self,
        provider: &mut dyn Provider,
        task: Arc<dyn crate::task::BaseTask>,
        args: Vec<Value>,
    ) -> Result<ResultsList> {
        self.invoke(provider, move |ctx| {
            let task = Arc::clone(&task);
            let args = args.clone();
            async move { crate::task::invoke_task(task, ctx, args, Default::default()).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalProvider;

    #[tokio::test]
    async fn local_echo_produces_one_passed_outcome() {
        let executor = Executor::new(4);
        let mut provider = LocalProvider;
        let results = executor
            .invoke(&mut provider, |ctx| async move {
                let out = ctx.sh("echo hello").await?;
                Ok(Value::Str(out))
            })
            .await
            .unwrap();
        assert_eq!(results.outcomes.len(), 1);
        assert_eq!(results.outcomes[0].bucket, Bucket::Passed);
        assert_eq!(results.outcomes[0].result, Some(Value::Str("hello\n".into())));
    }

    struct FixedContextsProvider(Vec<Context>);
    impl Provider for FixedContextsProvider {
        fn contexts(&self) -> Result<Vec<Context>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn concurrency_cap_limits_parallelism() {
        let contexts: Vec<Context> = (0..10).map(|_| Context::local()).collect();
        let mut provider = FixedContextsProvider(contexts);
        let executor = Executor::new(2);
        let start = std::time::Instant::now();
        let results = executor
            .invoke(&mut provider, |_ctx| async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Ok(Value::Null)
            })
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(results.outcomes.len(), 10);
        assert!(results.outcomes.iter().all(|o| o.bucket == Bucket::Passed));
        assert!(elapsed >= std::time::Duration::from_millis(400));
    }

    #[tokio::test]
    async fn ctrlc_issued_aborts_the_join_loop() {
        let contexts: Vec<Context> = (0..10).map(|_| Context::local()).collect();
        let mut provider = FixedContextsProvider(contexts);
        let executor = Executor::new(10);
        let start = std::time::Instant::now();
        let result = executor
            .invoke(&mut provider, |_ctx| async move {
                CTRLC_ISSUED.store(true, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(Value::Null)
            })
            .await;
        CTRLC_ISSUED.store(false, Ordering::SeqCst);
        assert!(matches!(result, Err(CrewError::Cancelled)));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }
}
