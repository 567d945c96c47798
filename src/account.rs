//! Process-local, per-user persistent identity: a stable UUID and SSH
//! keypair rooted at `~/.precip`, reused verbatim across runs so concurrent
//! experiments from the same account share a cloud-side keypair name and
//! security group without coordination.

use crate::error::{PrecipError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub struct AccountContext {
    pub uid: String,
    pub config_dir: PathBuf,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
}

impl AccountContext {
    /// Ensures `~/.precip`, `account_id`, and the `precip_<uid>`/`.pub`
    /// keypair exist, creating whatever is missing. Safe to call repeatedly
    /// and from multiple concurrent processes for the same user.
    pub async fn load() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| PrecipError::Configuration("cannot locate home directory".into()))?;
        let config_dir = home.join(".precip");
        tokio::fs::create_dir_all(&config_dir)
            .await
            .map_err(|e| PrecipError::Configuration(format!("creating {}: {e}", config_dir.display())))?;

        let uid = Self::load_or_create_account_id(&config_dir).await?;

        let private_key_path = config_dir.join(format!("precip_{uid}"));
        let public_key_path = config_dir.join(format!("precip_{uid}.pub"));
        if !tokio::fs::try_exists(&private_key_path).await.unwrap_or(false) {
            log::info!("Creating new ssh key in {}", config_dir.display());
            generate_keypair(&private_key_path).await?;
        }

        Ok(Self { uid, config_dir, private_key_path, public_key_path })
    }

    /// Stable name used to namespace cloud-side keypairs and security groups.
    pub fn resource_name(&self) -> String {
        format!("precip_{}", self.uid)
    }

    async fn load_or_create_account_id(config_dir: &Path) -> Result<String> {
        let account_id_path = config_dir.join("account_id");
        match tokio::fs::read_to_string(&account_id_path).await {
            Ok(contents) => Ok(contents.trim().to_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let uid = uuid::Uuid::new_v4().simple().to_string();
                tokio::fs::write(&account_id_path, &uid)
                    .await
                    .map_err(|e| PrecipError::Configuration(format!("writing {}: {e}", account_id_path.display())))?;
                Ok(uid)
            }
            Err(e) => Err(PrecipError::Configuration(format!("reading {}: {e}", account_id_path.display()))),
        }
    }
}

/// Shells out to `ssh-keygen` for a passwordless RSA keypair, the same way
/// the original does (`ssh-keygen -q -t rsa -f <path> </dev/null`).
async fn generate_keypair(private_key_path: &Path) -> Result<()> {
    let status = Command::new("ssh-keygen")
        .args(["-q", "-t", "rsa", "-N", "", "-f"])
        .arg(private_key_path)
        .stdin(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| PrecipError::Configuration(format!("spawning ssh-keygen: {e}")))?;
    if !status.success() {
        return Err(PrecipError::Configuration(format!("ssh-keygen exited with {status}")));
    }
    Ok(())
}
