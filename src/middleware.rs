use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// One interceptor in a [`Pipeline`].
///
/// A step may change the context before calling `next`, inspect or replace
/// the result afterwards, or return without calling `next` at all.
#[async_trait]
pub trait Middleware<C, R>: Send + Sync {
    async fn handle(&self, ctx: C, next: Next<C, R>) -> R;
}

pub struct FnMiddleware<F> {
    func: F,
}

impl<F> FnMiddleware<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<C, R, F, Fut> Middleware<C, R> for FnMiddleware<F>
where
    C: Send + 'static,
    R: Send + 'static,
    F: Fn(C, Next<C, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    async fn handle(&self, ctx: C, next: Next<C, R>) -> R {
        (self.func)(ctx, next).await
    }
}

type Steps<C, R> = Arc<Vec<Arc<dyn Middleware<C, R>>>>;
type Terminal<C, R> = Box<dyn FnOnce(C) -> BoxFuture<'static, R> + Send>;

/// Continuation handed to a step. Consumed by `run`, so the rest of the
/// chain executes at most once per step invocation.
pub struct Next<C, R> {
    steps: Steps<C, R>,
    index: usize,
    terminal: Terminal<C, R>,
}

impl<C, R> Next<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    pub async fn run(self, ctx: C) -> R {
        match self.steps.get(self.index).cloned() {
            Some(step) => {
                let next = Next {
                    steps: self.steps,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                step.handle(ctx, next).await
            }
            None => (self.terminal)(ctx).await,
        }
    }

    /// Steps still ahead of this continuation, excluding the terminal.
    pub fn remaining(&self) -> usize {
        self.steps.len().saturating_sub(self.index)
    }
}

/// Ordered chain of middleware around a terminal step.
///
/// The step list is shared between clones; each `run` walks it with its
/// own cursor, so concurrent runs never interfere.
pub struct Pipeline<C, R> {
    steps: Steps<C, R>,
}

impl<C, R> Pipeline<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            steps: Arc::new(Vec::new()),
        }
    }

    /// Append a step. Earlier steps wrap later ones.
    pub fn use_middleware(&mut self, step: impl Middleware<C, R> + 'static) -> &mut Self {
        Arc::make_mut(&mut self.steps).push(Arc::new(step));
        self
    }

    pub fn use_fn<F, Fut>(&mut self, func: F) -> &mut Self
    where
        F: Fn(C, Next<C, R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.use_middleware(FnMiddleware::new(func))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run `ctx` through every step, then `terminal`.
    pub async fn run<F, Fut>(&self, ctx: C, terminal: F) -> R
    where
        F: FnOnce(C) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let next = Next {
            steps: self.steps.clone(),
            index: 0,
            terminal: Box::new(move |ctx| Box::pin(terminal(ctx))),
        };
        next.run(ctx).await
    }
}

impl<C, R> Clone for Pipeline<C, R> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
        }
    }
}

impl<C, R> Default for Pipeline<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, R> std::fmt::Debug for Pipeline<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn tagging(
        log: Log,
        tag: &'static str,
    ) -> impl Fn(String, Next<String, String>) -> BoxFuture<'static, String> + Send + Sync {
        move |ctx, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{}-before", tag));
                let result = next.run(format!("{}{}", ctx, tag)).await;
                log.lock().push(format!("{}-after", tag));
                result
            })
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_runs_terminal() {
        let pipeline: Pipeline<u32, u32> = Pipeline::new();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.run(20, |n| async move { n + 1 }).await, 21);
    }

    #[tokio::test]
    async fn test_registration_order_is_wrapping_order() {
        let log: Log = Arc::default();
        let mut pipeline = Pipeline::new();
        pipeline
            .use_fn(tagging(log.clone(), "A"))
            .use_fn(tagging(log.clone(), "B"));

        let terminal_log = log.clone();
        let result = pipeline
            .run(String::new(), move |ctx| async move {
                terminal_log.lock().push("T".to_string());
                ctx
            })
            .await;

        assert_eq!(result, "AB");
        assert_eq!(
            *log.lock(),
            vec!["A-before", "B-before", "T", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let mut pipeline: Pipeline<u32, Result<u32, String>> = Pipeline::new();
        pipeline.use_fn(|n, next| async move {
            if n == 0 {
                return Err("rejected".to_string());
            }
            next.run(n).await
        });

        let reached = Arc::new(Mutex::new(0));
        let counter = reached.clone();
        let result = pipeline
            .run(0, move |n| async move {
                *counter.lock() += 1;
                Ok(n)
            })
            .await;

        assert_eq!(result, Err("rejected".to_string()));
        assert_eq!(*reached.lock(), 0);
    }

    #[tokio::test]
    async fn test_step_can_transform_result() {
        let mut pipeline: Pipeline<u32, u32> = Pipeline::new();
        pipeline.use_fn(|n, next| async move { next.run(n).await * 10 });
        assert_eq!(pipeline.run(4, |n| async move { n + 1 }).await, 50);
    }

    struct Counting;

    #[async_trait]
    impl Middleware<u32, u32> for Counting {
        async fn handle(&self, ctx: u32, next: Next<u32, u32>) -> u32 {
            assert_eq!(next.remaining(), 0);
            next.run(ctx + 1).await
        }
    }

    #[tokio::test]
    async fn test_trait_middleware() {
        let mut pipeline = Pipeline::new();
        pipeline.use_middleware(Counting);
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline.run(1, |n| async move { n }).await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_independent() {
        let mut pipeline: Pipeline<u64, u64> = Pipeline::new();
        pipeline
            .use_fn(|n, next| async move {
                tokio::task::yield_now().await;
                next.run(n * 2).await
            })
            .use_fn(|n, next| async move { next.run(n + 1).await });

        let mut tasks = Vec::new();
        for i in 0..200u64 {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move {
                let out = pipeline.run(i, |n| async move { n }).await;
                (i, out)
            }));
        }

        for task in tasks {
            let (i, out) = task.await.unwrap();
            assert_eq!(out, i * 2 + 1);
        }
    }

    #[tokio::test]
    async fn test_clone_shares_steps_but_not_later_additions() {
        let mut original: Pipeline<u32, u32> = Pipeline::new();
        original.use_fn(|n, next| async move { next.run(n + 1).await });

        let snapshot = original.clone();
        original.use_fn(|n, next| async move { next.run(n + 100).await });

        assert_eq!(snapshot.run(0, |n| async move { n }).await, 1);
        assert_eq!(original.run(0, |n| async move { n }).await, 101);
    }
}
