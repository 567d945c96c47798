//! Google Compute Engine backend.
//!
//! Grounded on the teacher's `src/vm_providers/gce.rs` (`gcloud-sdk`,
//! firewall-rule-if-missing, zone-scoped instance insert/get, NAT IP
//! extraction), generalized from "launch and block until running" into
//! "launch once, poll non-blockingly". SSH key injection uses project
//! metadata `sshKeys`, merged idempotently, per spec.md §4.2 — unlike the
//! teacher, which ships a `startup-script` because it has no SSH keypair of
//! its own to inject.

use super::{downcast_handle, BackendDriver, BackendHandle, PollOutcome};
use crate::account::AccountContext;
use crate::error::{PrecipError, Result};
use crate::instance::LaunchParams;
use async_trait::async_trait;
use gcloud_sdk::google_rest_apis::compute_v1::{
    firewall::Direction,
    firewalls_api::{ComputePeriodFirewallsPeriodGetParams, ComputePeriodFirewallsPeriodInsertParams},
    instance::Status,
    instances_api::{
        ComputePeriodInstancesPeriodDeleteParams, ComputePeriodInstancesPeriodGetParams, ComputePeriodInstancesPeriodInsertParams,
    },
    projects_api::{ComputePeriodProjectsPeriodGetParams, ComputePeriodProjectsPeriodSetCommonInstanceMetadataParams},
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, Error, Firewall, FirewallAllowedInner, Instance, Metadata, MetadataItemsInner,
    NetworkInterface, Scheduling, Tags,
};
use std::net::Ipv4Addr;

const INSTANCE_TAG: &str = "precip";
const INBOUND_FIREWALL_RULE_NAME: &str = "precip-allow-ssh";
const SSH_KEYS_METADATA_KEY: &str = "sshKeys";

/// `{project, zone, user}` per spec.md §6; credentials come from the
/// ambient environment (`GOOGLE_APPLICATION_CREDENTIALS`, `gcloud auth
/// application-default login`, or the GCE metadata server).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GceConfig {
    pub project: String,
    pub zone: String,
    pub user: String,
    pub machine_type: String,
    pub source_image: String,
}

pub struct GceDriver {
    config: GceConfig,
}

struct GceHandle {
    instance_name: String,
}

impl GceDriver {
    pub fn new(config: GceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendDriver for GceDriver {
    async fn prepare_account(&self, account: &AccountContext) -> Result<()> {
        let api = gcloud_sdk::GoogleRestApi::new().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;
        let configuration = api.create_google_compute_v1_config().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;

        // firewall rule: inbound tcp/22 for precip-tagged instances, created if absent
        let existing = gcloud_sdk::google_rest_apis::compute_v1::firewalls_api::compute_firewalls_get(
            &configuration,
            ComputePeriodFirewallsPeriodGetParams { project: self.config.project.clone(), firewall: INBOUND_FIREWALL_RULE_NAME.to_owned(), ..Default::default() },
        )
        .await;
        match existing {
            Err(Error::ResponseError(content)) if content.status.as_u16() == 404 => {
                gcloud_sdk::google_rest_apis::compute_v1::firewalls_api::compute_firewalls_insert(
                    &configuration,
                    ComputePeriodFirewallsPeriodInsertParams {
                        project: self.config.project.clone(),
                        firewall: Some(Firewall {
                            name: Some(INBOUND_FIREWALL_RULE_NAME.to_owned()),
                            target_tags: Some(vec![INSTANCE_TAG.to_owned()]),
                            direction: Some(Direction::Ingress),
                            allowed: Some(vec![FirewallAllowedInner { ip_protocol: Some("tcp".to_owned()), ports: Some(vec!["22".to_owned()]), ..Default::default() }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| PrecipError::Backend(e.into()))?;
                log::info!("{INBOUND_FIREWALL_RULE_NAME} (created)");
            }
            Err(e) => return Err(PrecipError::Backend(e.into())),
            Ok(_) => log::debug!("{INBOUND_FIREWALL_RULE_NAME} (already existed)"),
        }

        // project-wide sshKeys metadata: append this account's key if not already present
        let public_key = tokio::fs::read_to_string(&account.public_key_path)
            .await
            .map_err(|e| PrecipError::Configuration(format!("reading {}: {e}", account.public_key_path.display())))?;
        let entry = format!("{}:{}", self.config.user, public_key.trim());

        let project = gcloud_sdk::google_rest_apis::compute_v1::projects_api::compute_projects_get(
            &configuration,
            ComputePeriodProjectsPeriodGetParams { project: self.config.project.clone(), ..Default::default() },
        )
        .await
        .map_err(|e| PrecipError::Backend(e.into()))?;

        let mut metadata = project.common_instance_metadata.map(|m| *m).unwrap_or_default();
        let mut items = metadata.items.clone().unwrap_or_default();
        let existing_keys = items.iter().find(|i| i.key.as_deref() == Some(SSH_KEYS_METADATA_KEY)).and_then(|i| i.value.clone()).unwrap_or_default();

        if !existing_keys.lines().any(|line| line == entry) {
            let merged = if existing_keys.is_empty() { entry } else { format!("{existing_keys}\n{entry}") };
            items.retain(|i| i.key.as_deref() != Some(SSH_KEYS_METADATA_KEY));
            items.push(MetadataItemsInner { key: Some(SSH_KEYS_METADATA_KEY.to_owned()), value: Some(merged) });
            metadata.items = Some(items);

            gcloud_sdk::google_rest_apis::compute_v1::projects_api::compute_projects_set_common_instance_metadata(
                &configuration,
                ComputePeriodProjectsPeriodSetCommonInstanceMetadataParams {
                    project: self.config.project.clone(),
                    metadata: Some(Box::new(metadata)),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| PrecipError::Backend(e.into()))?;
            log::info!("registered ssh key for {} in project metadata", self.config.user);
        }

        Ok(())
    }

    async fn start_one(&self, _account: &AccountContext, params: &LaunchParams) -> Result<BackendHandle> {
        let api = gcloud_sdk::GoogleRestApi::new().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;
        let configuration = api.create_google_compute_v1_config().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;

        let instance_name = format!("precip-{}", uuid::Uuid::new_v4().simple());
        let tags: Vec<String> = std::iter::once(INSTANCE_TAG.to_owned()).chain(params.tags.iter().cloned()).take(self.tag_cap()).collect();

        let result = gcloud_sdk::google_rest_apis::compute_v1::instances_api::compute_instances_insert(
            &configuration,
            ComputePeriodInstancesPeriodInsertParams {
                project: self.config.project.clone(),
                zone: self.config.zone.clone(),
                instance: Some(Instance {
                    name: Some(instance_name.clone()),
                    machine_type: Some(format!("zones/{}/machineTypes/{}", self.config.zone, self.config.machine_type)),
                    disks: Some(vec![AttachedDisk {
                        boot: Some(true),
                        auto_delete: Some(true),
                        initialize_params: Some(Box::new(AttachedDiskInitializeParams { source_image: Some(self.config.source_image.clone()), ..Default::default() })),
                        ..Default::default()
                    }]),
                    tags: Some(Box::new(Tags { items: Some(tags), ..Default::default() })),
                    network_interfaces: Some(vec![NetworkInterface { access_configs: Some(vec![AccessConfig { ..Default::default() }]), ..Default::default() }]),
                    scheduling: Some(Box::new(Scheduling { automatic_restart: Some(false), ..Default::default() })),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await;

        if let Err(e) = result {
            return Err(PrecipError::Backend(anyhow::anyhow!("failed to launch instance: {e:#?}")));
        }

        Ok(Box::new(GceHandle { instance_name }))
    }

    async fn poll_ready(&self, handle: &BackendHandle) -> Result<PollOutcome> {
        let handle: &GceHandle = downcast_handle(handle, "GceHandle")?;
        let api = gcloud_sdk::GoogleRestApi::new().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;
        let configuration = api.create_google_compute_v1_config().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;

        let instance = match gcloud_sdk::google_rest_apis::compute_v1::instances_api::compute_instances_get(
            &configuration,
            ComputePeriodInstancesPeriodGetParams { project: self.config.project.clone(), zone: self.config.zone.clone(), instance: handle.instance_name.clone(), ..Default::default() },
        )
        .await
        {
            Ok(instance) => instance,
            Err(_) => return Ok(PollOutcome::Pending),
        };

        match instance.status {
            Some(Status::Provisioning) | Some(Status::Staging) | None => Ok(PollOutcome::Pending),
            Some(Status::Running) => {
                let iface = instance.network_interfaces.unwrap_or_default().into_iter().next();
                let Some(iface) = iface else { return Ok(PollOutcome::Pending) };
                let private_addr: Ipv4Addr = iface
                    .network_ip
                    .as_deref()
                    .unwrap_or("0.0.0.0")
                    .parse()
                    .map_err(|_| PrecipError::Backend(anyhow::anyhow!("instance has no parsable private address")))?;
                let public_addr = iface.access_configs.unwrap_or_default().into_iter().next().and_then(|c| c.nat_ip).and_then(|ip| ip.parse().ok());
                let Some(public_addr) = public_addr else { return Ok(PollOutcome::Pending) };
                Ok(PollOutcome::Ready { public_addr, private_addr })
            }
            Some(other) => Ok(PollOutcome::Failed(format!("instance transitioned into state: {other:?}"))),
        }
    }

    async fn terminate(&self, handle: &BackendHandle) -> Result<()> {
        let handle: &GceHandle = downcast_handle(handle, "GceHandle")?;
        let api = gcloud_sdk::GoogleRestApi::new().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;
        let configuration = api.create_google_compute_v1_config().await.map_err(|e| PrecipError::Configuration(e.to_string()))?;

        match gcloud_sdk::google_rest_apis::compute_v1::instances_api::compute_instances_delete(
            &configuration,
            ComputePeriodInstancesPeriodDeleteParams { project: self.config.project.clone(), zone: self.config.zone.clone(), instance: handle.instance_name.clone(), ..Default::default() },
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(Error::ResponseError(content)) if content.status.as_u16() == 404 => Ok(()), // already gone
            Err(e) => Err(PrecipError::Backend(e.into())),
        }
    }

    fn tag_cap(&self) -> usize {
        // GCE instance network tags are capped at 64 per instance by the platform.
        64
    }

    fn admin_user(&self) -> &str {
        "root"
    }
}
