//! `FanOutExecutor`: resolves a tag filter to the `Ready` subset and applies
//! `run`/`put`/`get`/`copy_and_run` across it, per spec.md §4.4.
//!
//! Grounded on the teacher's concurrent `tokio::spawn`/`futures` usage in
//! `worker.rs` for parallel awaits, generalized from "one VM" to "N
//! instances, registry-order-stable". `copy_and_run`'s random remote path is
//! grounded on both the original's `random.randint` and the teacher's
//! `rand::thread_rng().sample_iter(&Alphanumeric)` (used there for an OTP and
//! a GCE instance-name suffix).

use crate::drivers::BackendDriver;
use crate::engine::LifecycleEngine;
use crate::error::{PrecipError, Result};
use crate::instance::InstanceState;
use crate::ssh::SshTransport;
use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};

pub struct RunResult {
    pub exit_codes: Vec<i32>,
    pub stdouts: Vec<String>,
    pub stderrs: Vec<String>,
}

pub struct FanOutExecutor<'a, D: BackendDriver> {
    engine: &'a LifecycleEngine<D>,
}

impl<'a, D: BackendDriver> FanOutExecutor<'a, D> {
    pub fn new(engine: &'a LifecycleEngine<D>) -> Self {
        Self { engine }
    }

    async fn ready_targets(&self, tags: &[String]) -> Result<Vec<(String, String, String)>> {
        let registry = self.engine.registry().read().await;
        let matching = registry.subset(tags);
        if let Some(not_ready) = matching.iter().find(|i| i.state != InstanceState::Ready) {
            return Err(PrecipError::InstanceNotReady { instance_id: not_ready.id.clone(), state: not_ready.state.to_string() });
        }
        Ok(matching.into_iter().map(|i| (i.id.clone(), i.public_addr.clone(), i.private_addr.clone())).collect())
    }

    pub async fn run(
        &self,
        tags: &[String],
        cmd: &str,
        user: &str,
        check_exit: bool,
        output_base: Option<&Path>,
        use_private_addr: bool,
    ) -> Result<RunResult> {
        let targets = self.ready_targets(tags).await?;
        let ssh = self.engine.ssh();

        let outcomes = join_all(targets.iter().map(|(id, public, private)| {
            let host = if use_private_addr { private } else { public };
            async move { (id.clone(), ssh.run(host, user, cmd).await) }
        }))
        .await;

        let mut exit_codes = Vec::with_capacity(outcomes.len());
        let mut stdouts = Vec::with_capacity(outcomes.len());
        let mut stderrs = Vec::with_capacity(outcomes.len());
        let mut first_failure = None;

        for (id, outcome) in outcomes {
            let outcome = outcome.map_err(|e| PrecipError::Ssh(anyhow::anyhow!("{id}: {e}")))?;
            if let Some(base) = output_base {
                tokio::fs::write(format!("{}.{id}.stdout", base.display()), &outcome.stdout).await.ok();
                tokio::fs::write(format!("{}.{id}.stderr", base.display()), &outcome.stderr).await.ok();
            }
            if check_exit && outcome.exit_code != 0 && first_failure.is_none() {
                first_failure = Some((id.clone(), outcome.exit_code, outcome.stdout.clone(), outcome.stderr.clone()));
            }
            exit_codes.push(outcome.exit_code as i32);
            stdouts.push(outcome.stdout);
            stderrs.push(outcome.stderr);
        }

        if let Some((instance_id, exit_code, stdout, stderr)) = first_failure {
            return Err(PrecipError::RemoteCommandFailed { instance_id, exit_code, stdout, stderr });
        }

        Ok(RunResult { exit_codes, stdouts, stderrs })
    }

    pub async fn put(&self, tags: &[String], local: &Path, remote: &str, user: &str) -> Result<()> {
        let targets = self.ready_targets(tags).await?;
        let ssh = self.engine.ssh();
        let results = join_all(targets.iter().map(|(id, public, _)| async move { (id.clone(), ssh.put(public, user, local, remote).await) })).await;
        for (id, result) in results {
            result.map_err(|e| PrecipError::Ssh(anyhow::anyhow!("{id}: {e}")))?;
        }
        Ok(())
    }

    /// Appends `.<id>` to `local` when fanning out to more than one
    /// instance, per spec.md §4.4.
    pub async fn get(&self, tags: &[String], remote: &str, local: &Path, user: &str) -> Result<()> {
        let targets = self.ready_targets(tags).await?;
        let ssh = self.engine.ssh();
        let multi = targets.len() > 1;

        let results = join_all(targets.iter().map(|(id, public, _)| {
            let dest = if multi { PathBuf::from(format!("{}.{id}", local.display())) } else { local.to_path_buf() };
            async move { (id.clone(), ssh.get(public, user, remote, &dest).await) }
        }))
        .await;
        for (id, result) in results {
            result.map_err(|e| PrecipError::Ssh(anyhow::anyhow!("{id}: {e}")))?;
        }
        Ok(())
    }

    /// Stages `local_script` under a random `/tmp` path, runs it with
    /// `args` quoted, and removes it, per spec.md §4.4.
    pub async fn copy_and_run(&self, tags: &[String], local_script: &Path, args: &[String], user: &str, check_exit: bool) -> Result<RunResult> {
        let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(12).map(char::from).collect();
        let remote_path = format!("/tmp/precip-{suffix}");

        self.put(tags, local_script, &remote_path, user).await?;

        let quoted_args: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
        let cmd = format!("chmod 755 {remote_path} && {remote_path} {} ; rc=$?; rm -f {remote_path}; exit $rc", quoted_args.join(" "));

        self.run(tags, &cmd, user, check_exit, None, false).await
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
