//! Cloud-side runner lifecycle: create one VM-backed runner, tear one down
//! (pulling its metrics on the way out), and reclaim whatever cleanup finds.

use futures::{StreamExt, stream};
use std::path::PathBuf;

use crate::config::Config;
use crate::health::{HealthChecker, HealthState};
use crate::metrics::storage::{MAX_METRIC_FILE_SIZE, METRIC_FILES};
use crate::metrics::{MetricsStorage, RunnerMetrics};
use crate::naming::InstanceName;
use crate::openstack::{CloudInstance, KeyStore, OpenStackClient};
use crate::ssh::{SshClient, SshError};
use crate::userdata::UserData;

use super::RunnerError;

/// Where the VM's scripts leave their metric files.
const VM_METRICS_DIR: &str = "/home/ubuntu/metrics";
const RUNNER_DIR: &str = "/home/ubuntu/actions-runner";

#[derive(Clone)]
pub struct CloudRunnerManager {
    config: Config,
    client: OpenStackClient,
    keys: KeyStore,
    storage: MetricsStorage,
    health: HealthChecker,
    ssh: SshClient,
}

impl CloudRunnerManager {
    pub fn new(
        config: Config,
        client: OpenStackClient,
        keys: KeyStore,
        storage: MetricsStorage,
        health: HealthChecker,
        ssh: SshClient,
    ) -> Self {
        Self {
            config,
            client,
            keys,
            storage,
            health,
            ssh,
        }
    }

    pub async fn list_instances(&self) -> Result<Vec<CloudInstance>, RunnerError> {
        let mut client = self.client.clone();
        Ok(client.list_instances().await?)
    }

    /// Provision one runner end to end: keypair, keyfile, userdata, server.
    /// Any failure reclaims whatever was already created before surfacing.
    #[tracing::instrument(skip(self, registration_token), fields(prefix = %self.config.prefix))]
    pub async fn create_runner(
        &self,
        registration_token: &str,
    ) -> Result<InstanceName, RunnerError> {
        let name = InstanceName::generate(&self.config.prefix);
        let mut client = self.client.clone();

        let key_material = client.create_keypair(&name).await?;
        if let Err(e) = self.keys.write_key(&name, &key_material) {
            if let Err(cleanup) = client.delete_keypair(&name).await {
                tracing::warn!(error = %cleanup, name = %name, "failed to reclaim keypair");
            }
            return Err(RunnerError::Keyfile(e));
        }

        let user_data = UserData::for_runner(&self.config, &name, registration_token)
            .to_user_data()
            .map_err(RunnerError::Userdata)?;

        if let Err(e) = self.storage.ensure_dir(&name) {
            tracing::warn!(error = %e, name = %name, "failed to create metrics directory");
        }

        match client
            .launch_instance(
                &name,
                &self.config.openstack_image,
                &self.config.openstack_flavor,
                &self.config.openstack_network,
                &user_data,
            )
            .await
        {
            Ok(_) => {
                tracing::info!(name = %name, "created runner");
                Ok(name)
            }
            Err(e) => {
                // launch_instance reclaims the server itself; the keypair
                // and keyfile are ours to reclaim.
                if let Err(cleanup) = client.delete_keypair(&name).await {
                    tracing::debug!(error = %cleanup, name = %name, "keypair already gone");
                }
                if let Err(cleanup) = self.keys.delete_key(&name) {
                    tracing::warn!(error = %cleanup, name = %name, "failed to remove keyfile");
                }
                Err(e.into())
            }
        }
    }

    /// Tear one runner down: best-effort metric pull, graceful unregister,
    /// then server, keypair and keyfile. Returns the runner's metrics
    /// unless they were corrupt (quarantined) or unreachable.
    #[tracing::instrument(skip(self, instance, removal_token), fields(name = %instance.name))]
    pub async fn delete_runner(
        &self,
        instance: &CloudInstance,
        removal_token: &str,
    ) -> Result<Option<RunnerMetrics>, RunnerError> {
        let name = &instance.name;
        let keyfile = self.keys.key_path(name);
        let mut corrupt = false;

        for file in METRIC_FILES {
            let remote = PathBuf::from(VM_METRICS_DIR).join(file);
            match self
                .ssh
                .read_file(
                    instance.addresses.clone(),
                    keyfile.clone(),
                    remote,
                    MAX_METRIC_FILE_SIZE,
                )
                .await
            {
                Ok(Some(contents)) => {
                    if let Err(e) = self.storage.store_file(name, file, &contents) {
                        tracing::warn!(error = %e, file, "failed to store pulled metrics file");
                    }
                }
                Ok(None) => {}
                Err(e @ SshError::FileTooLarge { .. }) => {
                    tracing::warn!(error = %e, file, "oversized metrics file");
                    corrupt = true;
                }
                Err(e) => {
                    tracing::debug!(error = %e, file, "metrics pull failed");
                }
            }
        }

        let remove = format!(
            "cd {RUNNER_DIR} && sudo -u ubuntu ./config.sh remove --token {removal_token}"
        );
        if let Err(e) = self
            .ssh
            .exec(instance.addresses.clone(), keyfile.clone(), remove)
            .await
        {
            // A crashed VM cannot unregister itself; phantom cleanup will
            // collect the CI-side record later.
            tracing::debug!(error = %e, "graceful unregister failed");
        }

        let mut client = self.client.clone();
        client.delete_server(&instance.server_id).await?;

        if let Err(e) = client.delete_keypair(name).await {
            tracing::warn!(error = %e, "failed to delete keypair");
        }
        if let Err(e) = self.keys.delete_key(name) {
            tracing::warn!(error = %e, "failed to delete keyfile");
        }

        let metrics = if corrupt {
            if let Err(e) = self.storage.quarantine(name) {
                tracing::error!(error = %e, "failed to quarantine metrics directory");
            }
            None
        } else {
            self.storage.load_or_quarantine(name)
        };

        if let Err(e) = self.storage.delete_dir(name) {
            tracing::warn!(error = %e, "failed to remove metrics directory");
        }

        tracing::info!("deleted runner");
        Ok(metrics)
    }

    /// Health-check the fleet and delete what is `Unhealthy`; `Healthy` and
    /// `Unknown` instances are left strictly alone. Also reconciles key
    /// material and collects orphaned metric directories.
    #[tracing::instrument(skip(self, removal_token), fields(prefix = %self.config.prefix))]
    pub async fn cleanup(
        &self,
        removal_token: &str,
    ) -> Result<Vec<(InstanceName, Option<RunnerMetrics>)>, RunnerError> {
        let instances = self.list_instances().await?;
        let concurrency = instances.len().max(1);

        let checked: Vec<(CloudInstance, HealthState)> = stream::iter(
            instances.into_iter().map(|instance| {
                let manager = self.clone();
                async move {
                    let health = manager.health.check(&instance, false).await;
                    (instance, health)
                }
            }),
        )
        .buffer_unordered(concurrency)
        .collect()
        .await;

        let unhealthy: Vec<CloudInstance> = checked
            .into_iter()
            .filter(|(_, health)| *health == HealthState::Unhealthy)
            .map(|(instance, _)| instance)
            .collect();

        let mut deleted = vec![];
        let concurrency = unhealthy.len().max(1);
        let results: Vec<(InstanceName, Result<Option<RunnerMetrics>, RunnerError>)> =
            stream::iter(unhealthy.into_iter().map(|instance| {
                let manager = self.clone();
                let token = removal_token.to_string();
                async move {
                    let result = manager.delete_runner(&instance, &token).await;
                    (instance.name, result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (name, result) in results {
            match result {
                Ok(metrics) => deleted.push((name, metrics)),
                Err(e) => tracing::error!(error = %e, name = %name, "failed to delete unhealthy runner"),
            }
        }

        let mut client = self.client.clone();
        if let Err(e) = client.cleanup(&self.keys).await {
            tracing::error!(error = %e, "key reconciliation failed");
        }

        let live: std::collections::HashSet<InstanceName> = self
            .list_instances()
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();
        match self
            .storage
            .collect_orphans(&self.config.prefix, &live, std::time::SystemTime::now())
        {
            Ok(collected) if collected > 0 => {
                tracing::info!(collected, "collected orphaned metric directories")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "metrics orphan collection failed"),
        }

        Ok(deleted)
    }
}
