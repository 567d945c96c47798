//! Integration tests against a hand-rolled `MockDriver`/`MockSsh`, covering
//! the invariants and end-to-end scenarios the lifecycle engine must
//! satisfy regardless of backend. No real network I/O anywhere in this file.

use precip::account::AccountContext;
use precip::drivers::{BackendDriver, BackendHandle, PollOutcome};
use precip::ssh::{RunOutcome, SshTransport};
use precip::{Experiment, PrecipError};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

fn test_account() -> AccountContext {
    let dir = std::env::temp_dir();
    AccountContext {
        uid: "test".to_owned(),
        config_dir: dir.clone(),
        private_key_path: dir.join("precip_test_key"),
        public_key_path: dir.join("precip_test_key.pub"),
    }
}

/// Per-handle launch/poll/terminate bookkeeping. Handle indices are
/// assigned in `start_one` call order, which for the engine's own
/// `join_all`-based dispatch matches registry insertion order.
struct MockDriver {
    tag_cap: usize,
    terminated: Mutex<Vec<bool>>,
    poll_scripts: Mutex<Vec<VecDeque<PollOutcome>>>,
    launch_failures: Mutex<VecDeque<bool>>,
}

impl MockDriver {
    fn new() -> Self {
        Self { tag_cap: 10, terminated: Mutex::new(Vec::new()), poll_scripts: Mutex::new(Vec::new()), launch_failures: Mutex::new(VecDeque::new()) }
    }

    /// Registers the poll-outcome script consumed by the next `start_one`
    /// call, in order. The last entry repeats once exhausted.
    fn push_poll_script(&self, script: Vec<PollOutcome>) {
        self.poll_scripts.lock().unwrap().push(VecDeque::from(script));
    }

    fn push_launch_failure(&self, fail: bool) {
        self.launch_failures.lock().unwrap().push_back(fail);
    }

    fn handle_count(&self) -> usize {
        self.terminated.lock().unwrap().len()
    }

    fn terminated_count(&self) -> usize {
        self.terminated.lock().unwrap().iter().filter(|t| **t).count()
    }
}

#[async_trait]
impl BackendDriver for MockDriver {
    async fn prepare_account(&self, _account: &AccountContext) -> precip::Result<()> {
        Ok(())
    }

    async fn start_one(&self, _account: &AccountContext, _params: &precip::instance::LaunchParams) -> precip::Result<BackendHandle> {
        if self.launch_failures.lock().unwrap().pop_front().unwrap_or(false) {
            return Err(PrecipError::Backend(anyhow::anyhow!("mock launch refused")));
        }

        let idx = {
            let mut terminated = self.terminated.lock().unwrap();
            let idx = terminated.len();
            terminated.push(false);
            idx
        };
        {
            let mut scripts = self.poll_scripts.lock().unwrap();
            if scripts.len() <= idx {
                scripts.push(VecDeque::from(vec![PollOutcome::Pending]));
            }
        }
        Ok(Box::new(idx as u64))
    }

    async fn poll_ready(&self, handle: &BackendHandle) -> precip::Result<PollOutcome> {
        let idx = *handle.downcast_ref::<u64>().expect("mock handle") as usize;
        let mut scripts = self.poll_scripts.lock().unwrap();
        let queue = &mut scripts[idx];
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            Ok(queue.front().cloned().unwrap_or(PollOutcome::Pending))
        }
    }

    async fn terminate(&self, handle: &BackendHandle) -> precip::Result<()> {
        let idx = *handle.downcast_ref::<u64>().expect("mock handle") as usize;
        self.terminated.lock().unwrap()[idx] = true;
        Ok(())
    }

    fn tag_cap(&self) -> usize {
        self.tag_cap
    }

    fn admin_user(&self) -> &str {
        "root"
    }
}

/// Scripted SSH transport, keyed by host address. Each `run` call against a
/// host pops its next scripted outcome; an exhausted or never-registered
/// queue falls back to a plain exit-0 success (good enough for the
/// bootstrap step, which this suite doesn't normally need to fail).
struct MockSsh {
    run_queues: Mutex<HashMap<String, VecDeque<precip::Result<RunOutcome>>>>,
}

impl MockSsh {
    fn new() -> Self {
        Self { run_queues: Mutex::new(HashMap::new()) }
    }

    fn push_run(&self, host: &str, outcome: precip::Result<RunOutcome>) {
        self.run_queues.lock().unwrap().entry(host.to_owned()).or_default().push_back(outcome);
    }
}

fn ok_outcome(exit_code: u32, stdout: &str) -> precip::Result<RunOutcome> {
    Ok(RunOutcome { exit_code, stdout: stdout.to_owned(), stderr: String::new() })
}

#[async_trait]
impl SshTransport for MockSsh {
    async fn run(&self, host: &str, _user: &str, _cmd: &str) -> precip::Result<RunOutcome> {
        let mut queues = self.run_queues.lock().unwrap();
        match queues.entry(host.to_owned()).or_default().pop_front() {
            Some(outcome) => outcome,
            None => Ok(RunOutcome { exit_code: 0, stdout: String::new(), stderr: String::new() }),
        }
    }

    async fn put_bytes(&self, _host: &str, _user: &str, _contents: &[u8], _remote: &str) -> precip::Result<()> {
        Ok(())
    }

    async fn get(&self, _host: &str, _user: &str, _remote: &str, _local: &std::path::Path) -> precip::Result<()> {
        Ok(())
    }
}

fn make_experiment(driver: MockDriver, ssh: MockSsh, name: &str) -> Experiment<MockDriver> {
    Experiment::with_ssh(driver, test_account(), Arc::new(ssh), name)
}

// S1 — single happy path. Also exercises invariant 2 (Ready ⇒ reachable).
#[tokio::test]
async fn s1_single_happy_path() {
    let driver = MockDriver::new();
    driver.push_poll_script(vec![PollOutcome::Pending, PollOutcome::Ready { public_addr: Ipv4Addr::new(1, 2, 3, 4), private_addr: Ipv4Addr::new(10, 0, 0, 4) }]);
    let ssh = MockSsh::new();
    ssh.push_run("1.2.3.4", ok_outcome(0, "")); // bootstrap
    ssh.push_run("1.2.3.4", ok_outcome(0, "hi\n")); // fan-out echo

    let experiment = make_experiment(driver, ssh, "s1");
    experiment.provision("img", "small", vec![], 1, vec!["m".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["m".into()]).await.unwrap();

    let listed = experiment.list(&["m".into()]).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].public_address, "1.2.3.4");

    let result = experiment.run(&["m".into()], "echo hi", "root", true, None, false).await.unwrap();
    assert_eq!(result.exit_codes, vec![0]);
    assert_eq!(result.stdouts, vec!["hi\n".to_owned()]);
    assert_eq!(result.stderrs, vec!["".to_owned()]);
}

// S2 — retry recovers. Also exercises invariant 7 (retry replaces handle).
#[tokio::test]
async fn s2_retry_recovers() {
    let driver = MockDriver::new();
    driver.push_poll_script(vec![PollOutcome::Failed("launch rejected".into())]);
    driver.push_poll_script(vec![PollOutcome::Ready { public_addr: Ipv4Addr::new(5, 6, 7, 8), private_addr: Ipv4Addr::new(10, 0, 0, 8) }]);
    let ssh = MockSsh::new();

    let experiment = make_experiment(driver, ssh, "s2");
    experiment.provision("img", "small", vec![], 1, vec!["m".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["m".into()]).await.unwrap();

    let listed = experiment.list(&["m".into()]).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].public_address, "5.6.7.8");
}

// S3 — timeout fails. Also exercises invariant 1 (at-most-max-starts).
#[tokio::test(start_paused = true)]
async fn s3_timeout_fails() {
    let driver = MockDriver::new();
    driver.push_poll_script(vec![PollOutcome::Pending]);
    let ssh = MockSsh::new();

    let experiment = Arc::new(make_experiment(driver, ssh, "s3"));
    experiment.provision("img", "small", vec![], 1, vec!["m".into()], Duration::from_secs(5), 2).await.unwrap();

    let wait_task = {
        let experiment = experiment.clone();
        tokio::spawn(async move { experiment.wait(&["m".into()]).await })
    };

    let mut finished = false;
    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        if wait_task.is_finished() {
            finished = true;
            break;
        }
    }
    assert!(finished, "wait() did not converge within the expected number of scans");

    let result = wait_task.await.unwrap();
    match result {
        Err(PrecipError::BootTimeout { num_starts, .. }) => assert_eq!(num_starts, 2),
        other => panic!("expected BootTimeout, got {other:?}"),
    }

    experiment.deprovision(&[]).await.unwrap();
    assert_eq!(experiment.list(&[]).await.len(), 0);
}

// S4 — bootstrap non-zero is fatal, no retry.
#[tokio::test]
async fn s4_bootstrap_nonzero_is_fatal() {
    let driver = MockDriver::new();
    driver.push_poll_script(vec![PollOutcome::Ready { public_addr: Ipv4Addr::new(9, 9, 9, 9), private_addr: Ipv4Addr::new(10, 0, 0, 9) }]);
    let ssh = MockSsh::new();
    ssh.push_run("9.9.9.9", ok_outcome(7, ""));

    let experiment = make_experiment(driver, ssh, "s4");
    experiment.provision("img", "small", vec![], 1, vec!["m".into()], Duration::from_secs(60), 3).await.unwrap();

    let err = experiment.wait(&["m".into()]).await.unwrap_err();
    match err {
        PrecipError::BootstrapFailed { exit_code, .. } => assert_eq!(exit_code, 7),
        other => panic!("expected BootstrapFailed, got {other:?}"),
    }

    experiment.deprovision(&[]).await.unwrap();
}

// S5 — tagged fan-out. Also exercises invariant 3 (tag filter correctness).
#[tokio::test]
async fn s5_tagged_fanout() {
    let driver = MockDriver::new();
    for idx in 0..3u8 {
        driver.push_poll_script(vec![PollOutcome::Ready { public_addr: Ipv4Addr::new(1, 1, 1, idx), private_addr: Ipv4Addr::new(10, 1, 1, idx) }]);
    }
    let ssh = MockSsh::new();

    let experiment = make_experiment(driver, ssh, "s5");
    experiment.provision("img", "small", vec![], 1, vec!["a".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["a".into()]).await.unwrap();
    experiment.provision("img", "small", vec![], 1, vec!["a".into(), "b".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["a".into(), "b".into()]).await.unwrap();
    experiment.provision("img", "small", vec![], 1, vec!["b".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["b".into()]).await.unwrap();

    let only_a = experiment.run(&["a".into()], "true", "root", false, None, false).await.unwrap();
    assert_eq!(only_a.exit_codes.len(), 2);

    let a_and_b = experiment.run(&["a".into(), "b".into()], "true", "root", false, None, false).await.unwrap();
    assert_eq!(a_and_b.exit_codes.len(), 1);
}

// S6 — finalizer teardown after a partial provisioning failure.
// Also exercises invariant 5 (finalizer safety).
#[tokio::test]
async fn s6_finalizer_teardown() {
    let driver = MockDriver::new();
    driver.push_launch_failure(false);
    driver.push_launch_failure(false);
    driver.push_launch_failure(true);
    for _ in 0..2 {
        driver.push_poll_script(vec![PollOutcome::Pending]);
    }
    let ssh = MockSsh::new();

    let experiment = make_experiment(driver, ssh, "s6");
    let result = experiment.provision("img", "small", vec![], 3, vec!["m".into()], Duration::from_secs(60), 3).await;
    assert!(result.is_err());

    experiment.deprovision(&[]).await.unwrap();
    assert_eq!(experiment.list(&[]).await.len(), 0);
}

// Invariant 4 — idempotent teardown: a second deprovision() is a no-op.
#[tokio::test]
async fn invariant4_idempotent_teardown() {
    let driver = MockDriver::new();
    driver.push_poll_script(vec![PollOutcome::Ready { public_addr: Ipv4Addr::new(2, 2, 2, 2), private_addr: Ipv4Addr::new(10, 2, 2, 2) }]);
    let ssh = MockSsh::new();

    let experiment = make_experiment(driver, ssh, "inv4");
    experiment.provision("img", "small", vec![], 1, vec!["m".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["m".into()]).await.unwrap();

    experiment.deprovision(&[]).await.unwrap();
    assert_eq!(experiment.list(&[]).await.len(), 0);
    experiment.deprovision(&[]).await.unwrap();
    assert_eq!(experiment.list(&[]).await.len(), 0);
}

// Invariant 6 — fan-out ordering: result lists follow registry insertion order.
#[tokio::test]
async fn invariant6_fanout_ordering() {
    let driver = MockDriver::new();
    let hosts = ["10.9.0.0", "10.9.0.1", "10.9.0.2"];
    for (idx, host) in hosts.iter().enumerate() {
        let octets: Vec<u8> = host.split('.').map(|o| o.parse().unwrap()).collect();
        driver.push_poll_script(vec![PollOutcome::Ready {
            public_addr: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
            private_addr: Ipv4Addr::new(10, 0, 0, idx as u8),
        }]);
    }
    let ssh = MockSsh::new();
    for host in &hosts {
        ssh.push_run(host, ok_outcome(0, "")); // bootstrap
        ssh.push_run(host, ok_outcome(0, host)); // ordering marker
    }

    let experiment = make_experiment(driver, ssh, "inv6");
    experiment.provision("img", "small", vec![], 3, vec!["m".into()], Duration::from_secs(60), 3).await.unwrap();
    experiment.wait(&["m".into()]).await.unwrap();

    let result = experiment.run(&["m".into()], "marker", "root", false, None, false).await.unwrap();
    assert_eq!(result.stdouts, hosts.to_vec());
}
