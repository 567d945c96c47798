//! `BackendDriver`: the seam every cloud backend implements so the engine
//! never needs to know whether it's talking to EC2, GCE, or Azure.
//!
//! Grounded on the teacher's `VmProvider` trait (`vm_providers/mod.rs`),
//! generalized from a single blocking `spawn` into the non-blocking
//! start/poll/terminate triad the lifecycle engine needs: a driver must
//! never block the whole provisioning pass on one instance's boot.

mod azure;
mod ec2;
mod gce;

pub use azure::AzureDriver;
pub use ec2::Ec2Driver;
pub use gce::GceDriver;

use crate::account::AccountContext;
use crate::error::Result;
use crate::instance::LaunchParams;
use async_trait::async_trait;
use std::any::Any;
use std::net::Ipv4Addr;

/// Opaque, driver-owned state threaded back into `poll_ready`/`terminate`.
/// An EC2 driver stores an instance id, a GCE driver an operation + instance
/// name, an Azure driver a `JoinHandle` for its background provisioning task.
pub type BackendHandle = Box<dyn Any + Send + Sync>;

#[derive(Clone)]
pub enum PollOutcome {
    Pending,
    Ready { public_addr: Ipv4Addr, private_addr: Ipv4Addr },
    Failed(String),
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// One-time, idempotent account-level setup: register the account
    /// keypair, open the inbound security rule, and so on. Safe to call on
    /// every process startup.
    async fn prepare_account(&self, account: &AccountContext) -> Result<()>;

    /// Issues the launch request and returns immediately with a handle;
    /// actual boot progress is observed via repeated `poll_ready` calls.
    async fn start_one(&self, account: &AccountContext, params: &LaunchParams) -> Result<BackendHandle>;

    /// Non-blocking status check. Drivers that can't distinguish "still
    /// booting" from "transiently unreachable" should return `Pending`
    /// rather than `Failed`; only a backend-confirmed terminal failure
    /// (the VM itself reports an error, or the launch was rejected) should
    /// return `Failed`.
    async fn poll_ready(&self, handle: &BackendHandle) -> Result<PollOutcome>;

    /// Best-effort teardown. Must not panic or block indefinitely on an
    /// already-gone instance; callers treat this as a finalizer.
    async fn terminate(&self, handle: &BackendHandle) -> Result<()>;

    /// Maximum number of tags this backend can attach to one instance.
    /// Drivers advertise their own limit rather than the engine hardcoding
    /// one backend's number for all of them.
    fn tag_cap(&self) -> usize;

    /// User the bootstrap script runs as on a freshly-launched instance:
    /// `root` for EC2/GCE, the configured admin user for Azure (whose
    /// images disable root login and only provision the admin user's key).
    fn admin_user(&self) -> &str;
}

pub(crate) fn downcast_handle<T: 'static>(handle: &BackendHandle, what: &str) -> Result<&T> {
    handle.downcast_ref::<T>().ok_or_else(|| {
        crate::error::PrecipError::Backend(anyhow::anyhow!("internal error: handle is not a {what}"))
    })
}
