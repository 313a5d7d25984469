use linch_core::Result;
use linch_sandbox::SandboxExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::context::ExtensionContext;
use crate::extension::{Extension, LifecycleHook};
use crate::monitor::HealthResponse;

/// Runtime wrapper for one registered extension. Owns its sandbox executor
/// and its context; hooks run through the executor so they are recorded
/// and bounded by the hook timeout.
pub struct ExtensionInstance {
    pub extension: Extension,
    pub context: ExtensionContext,
    executor: Arc<SandboxExecutor>,
    hook_timeout: Duration,
}

impl ExtensionInstance {
    pub fn new(
        extension: Extension,
        context: ExtensionContext,
        executor: SandboxExecutor,
        hook_timeout: Duration,
    ) -> Self {
        Self {
            extension,
            context,
            executor: Arc::new(executor),
            hook_timeout,
        }
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    pub async fn run_hook(&self, hook: LifecycleHook) -> Result<()> {
        let hooks = Arc::clone(&self.extension.hooks);
        let ctx = self.context.clone();
        debug!(extension = %ctx.name, hook = %hook, "running lifecycle hook");

        let task = async move {
            match hook {
                LifecycleHook::Init => hooks.init(&ctx).await,
                LifecycleHook::Setup => hooks.setup(&ctx).await,
                LifecycleHook::Start => hooks.start(&ctx).await,
                LifecycleHook::Ready => hooks.ready(&ctx).await,
                LifecycleHook::Stop => hooks.stop(&ctx).await,
                LifecycleHook::Destroy => hooks.destroy(&ctx).await,
            }
        };
        self.executor
            .execute_task(hook.as_str(), task, Some(self.hook_timeout))
            .await
    }

    /// Run and time the extension's `health_check` hook. Errors and
    /// timeouts yield `None`.
    pub async fn timed_health_check(&self) -> Option<HealthResponse> {
        let hooks = Arc::clone(&self.extension.hooks);
        let ctx = self.context.clone();
        let started = Instant::now();
        let healthy = self
            .executor
            .execute_task(
                "health_check",
                async move { hooks.health_check(&ctx).await },
                Some(self.hook_timeout),
            )
            .await
            .ok()?;
        Some(HealthResponse {
            healthy,
            elapsed: started.elapsed(),
        })
    }

    /// Stop in-flight sandbox work, drop listeners and release the isolate.
    pub async fn dispose(&self) {
        self.context.events.off_all();
        self.executor.dispose().await;
    }
}
