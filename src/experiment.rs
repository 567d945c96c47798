//! `Experiment`: the facade exposed to users (spec.md §6), binding an
//! `AccountContext` to a chosen `BackendDriver`, the `LifecycleEngine`, and
//! the `FanOutExecutor`.
//!
//! Grounded on the teacher's top-level `fleeting` CLI flow (account setup →
//! provider → spawn → SSH), reshaped into a library entry point: no CLI
//! parsing lives here (that's out of scope per spec.md §1), just the
//! binding of collaborators and the deprovision-on-drop finalizer guarantee
//! of spec.md §5 ("overall cancellation... must still run deprovision([])").

use crate::account::AccountContext;
use crate::drivers::BackendDriver;
use crate::engine::{LifecycleEngine, ProvisionSpec};
use crate::error::Result;
use crate::fanout::{FanOutExecutor, RunResult};
use crate::instance::{InstanceInfo, LaunchParams};
use crate::ssh::SshTransport;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

pub struct Experiment<D: BackendDriver> {
    engine: LifecycleEngine<D>,
}

impl<D: BackendDriver> Experiment<D> {
    /// Binds a freshly loaded (or caller-supplied) `AccountContext` to
    /// `driver` under `name`, which seeds the `<name>-<counter>` instance id
    /// scheme of spec.md §4.3.
    pub fn new(driver: D, account: AccountContext, name: impl Into<String>) -> Self {
        Self { engine: LifecycleEngine::new(Arc::new(driver), Arc::new(account), name) }
    }

    /// Same as `new`, but with the SSH transport injected — used by tests to
    /// swap in a fake transport instead of opening real TCP connections.
    pub fn with_ssh(driver: D, account: AccountContext, ssh: Arc<dyn SshTransport>, name: impl Into<String>) -> Self {
        Self { engine: LifecycleEngine::with_ssh(Arc::new(driver), Arc::new(account), ssh, name) }
    }

    pub async fn provision(&self, image: &str, size: &str, network: Vec<String>, count: u32, tags: Vec<String>, boot_timeout: Duration, max_starts: u32) -> Result<()> {
        let launch_params = LaunchParams { image: image.to_owned(), size: size.to_owned(), network, tags: Vec::new() };
        self.engine.provision(ProvisionSpec { count, tags, launch_params, boot_timeout, max_starts }).await
    }

    pub async fn wait(&self, tags: &[String]) -> Result<()> {
        self.engine.wait(tags).await
    }

    pub async fn list(&self, tags: &[String]) -> Vec<InstanceInfo> {
        self.engine.list(tags).await
    }

    pub async fn get_public_hostnames(&self, tags: &[String]) -> Vec<String> {
        self.engine.list(tags).await.into_iter().map(|i| i.public_address).collect()
    }

    pub async fn get_private_hostnames(&self, tags: &[String]) -> Vec<String> {
        self.engine.list(tags).await.into_iter().map(|i| i.private_address).collect()
    }

    pub async fn run(&self, tags: &[String], cmd: &str, user: &str, check_exit: bool, output_base: Option<&Path>, use_private_addr: bool) -> Result<RunResult> {
        FanOutExecutor::new(&self.engine).run(tags, cmd, user, check_exit, output_base, use_private_addr).await
    }

    pub async fn put(&self, tags: &[String], local: &Path, remote: &str, user: &str) -> Result<()> {
        FanOutExecutor::new(&self.engine).put(tags, local, remote, user).await
    }

    pub async fn get(&self, tags: &[String], remote: &str, local: &Path, user: &str) -> Result<()> {
        FanOutExecutor::new(&self.engine).get(tags, remote, local, user).await
    }

    pub async fn copy_and_run(&self, tags: &[String], local_script: &Path, args: &[String], user: &str, check_exit: bool) -> Result<RunResult> {
        FanOutExecutor::new(&self.engine).copy_and_run(tags, local_script, args, user, check_exit).await
    }

    pub async fn deprovision(&self, tags: &[String]) -> Result<()> {
        self.engine.deprovision(tags).await
    }

    /// Runs `f` and, if it returns an error, best-effort deprovisions every
    /// instance before propagating. Rust can't await inside `Drop`, so this
    /// combinator is the idiomatic substitute for spec.md §5's "overall
    /// cancellation must still run deprovision([])" guarantee: callers that
    /// need it wrap their experiment body in `experiment.guarded(|| async {
    /// ... }).await`.
    pub async fn guarded<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match f().await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(cleanup_err) = self.deprovision(&[]).await {
                    log::error!("deprovision during error unwind failed: {cleanup_err}");
                }
                Err(e)
            }
        }
    }
}
