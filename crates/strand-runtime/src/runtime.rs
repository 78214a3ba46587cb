//! The runtime facade: configuration, root-fiber spawning, and blocking
//! entry points for code outside the effect world.

use crate::fiber::{Fiber, FiberContext};
use crate::fiber_ref::FiberRefs;
use crate::io::Io;
use crate::logger::{Logger, TracingLogger};
use crate::scheduler::{PoolScheduler, Scheduler};
use std::sync::Arc;
use strand_core::{Cause, Exit, FiberError};

/// Interpreter tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Operations one fiber may execute per turn before it is requeued.
    pub max_ops: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { max_ops: 2048 }
    }
}

/// State shared by every fiber of one runtime.
pub(crate) struct RuntimeShared {
    pub(crate) config: RuntimeConfig,
    pub(crate) logger: Arc<dyn Logger>,
    /// Receives failure causes that completed with no observer to deliver
    /// them to, and suppressed failures dropped from successful exits.
    pub(crate) reporter: Box<dyn Fn(&Cause) + Send + Sync>,
}

/// An executor for effects.
///
/// Cheap to clone; clones share the scheduler and configuration. Fibers
/// spawned through the runtime are roots: they live in the global scope and
/// nothing tears them down except completion or an explicit interrupt.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<dyn Scheduler>,
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    /// A runtime backed by a default work-stealing pool.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a runtime.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Start `io` on a new root fiber and return its handle immediately.
    pub fn spawn<A, E>(&self, io: Io<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let context = FiberContext::new(
            io.into_effect(),
            Arc::new(()),
            FiberRefs::default(),
            None,
            self.scheduler.clone(),
            self.shared.clone(),
        );
        context.schedule_turn();
        Fiber::from_context(context)
    }

    /// Run `io` to completion, blocking the calling thread.
    ///
    /// Requires a scheduler that drives itself (the default pool does); with
    /// a manually driven scheduler this would block forever.
    pub fn block_on<A, E>(&self, io: Io<A, E>) -> Result<A, FiberError>
    where
        A: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.spawn(io).join_blocking()
    }

    /// Like [`Runtime::block_on`], returning the full exit.
    pub fn block_on_exit<A, E>(&self, io: Io<A, E>) -> Exit
    where
        A: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        self.spawn(io).await_blocking()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configures and builds a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    logger: Option<Arc<dyn Logger>>,
    reporter: Option<Box<dyn Fn(&Cause) + Send + Sync>>,
}

impl RuntimeBuilder {
    /// Override the interpreter configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the per-turn operation budget.
    #[must_use]
    pub fn max_ops(mut self, max_ops: usize) -> Self {
        self.config.max_ops = max_ops;
        self
    }

    /// Use `scheduler` instead of a fresh work-stealing pool.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Route log effects to `logger` instead of the `tracing` logger.
    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Receive failure causes that nothing observed.
    #[must_use]
    pub fn reporter(mut self, reporter: impl Fn(&Cause) + Send + Sync + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    /// Build the runtime.
    #[must_use]
    pub fn build(self) -> Runtime {
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(PoolScheduler::new()));
        let logger = self.logger.unwrap_or_else(|| Arc::new(TracingLogger));
        let reporter = self.reporter.unwrap_or_else(|| {
            Box::new(|cause: &Cause| {
                tracing::error!(%cause, "unobserved fiber failure");
            })
        });
        Runtime {
            scheduler,
            shared: Arc::new(RuntimeShared {
                config: self.config,
                logger,
                reporter,
            }),
        }
    }
}
