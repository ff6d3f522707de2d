use base64::prelude::*;
use chrono::{DateTime, TimeDelta, Utc};
use openstack_sdk::{
    AsyncOpenStack,
    api::{
        self, QueryAsync,
        compute::v2::{
            keypair::{create_20 as keypair_create, delete as keypair_delete, list as keypair_list},
            server::{create_20, delete, list_detailed},
        },
    },
    auth::AuthState,
    types::ServiceType,
};
use openstack_types::compute::v2::{
    keypair::response::create::KeypairResponse,
    server::response::{
        create::ServerResponse as CreateServerResponse,
        list_detailed::ServerResponse as ListServerResponse,
    },
};
use std::borrow::Cow;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

use super::keys::KeyStore;
use super::{CloudInstance, CloudRunnerState};
use crate::config::OpenStackCredentials;
use crate::naming::InstanceName;

/// A server must leave BUILD within this window or the launch is abandoned
/// and its resources reclaimed.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid openstack credentials: {0}")]
    Credentials(#[source] serde_json::Error),

    #[error("failed to build network request")]
    BuildNetworkRequest(#[from] create_20::NetworksBuilderError),

    #[error("failed to build server request")]
    BuildServerRequest(#[from] create_20::ServerBuilderError),

    #[error("failed to build server creation request")]
    BuildCreateRequest(#[from] create_20::RequestBuilderError),

    #[error("failed to build server list request")]
    BuildServerListRequest(#[from] list_detailed::RequestBuilderError),

    #[error("failed to build server deletion request")]
    BuildServerDeletionRequest(#[from] delete::RequestBuilderError),

    #[error("failed to build keypair request")]
    BuildKeypairRequest(#[from] keypair_create::KeypairBuilderError),

    #[error("failed to build keypair creation request")]
    BuildKeypairCreateRequest(#[from] keypair_create::RequestBuilderError),

    #[error("failed to build keypair deletion request")]
    BuildKeypairDeletionRequest(#[from] keypair_delete::RequestBuilderError),

    #[error("failed to build keypair list request")]
    BuildKeypairListRequest(#[from] keypair_list::RequestBuilderError),

    #[error("cloud did not return private key material for keypair {0}")]
    MissingPrivateKey(String),

    #[error("server {name} did not become active within {:?}", LAUNCH_TIMEOUT)]
    LaunchTimeout { name: InstanceName },

    #[error("server {name} entered ERROR state during launch")]
    LaunchFailed { name: InstanceName },

    #[error("keyfile store error")]
    KeyStore(#[source] std::io::Error),

    #[error(transparent)]
    Api(#[from] openstack_sdk::api::ApiError<openstack_sdk::RestError>),

    #[error(transparent)]
    OpenStack(#[from] openstack_sdk::OpenStackError),
}

/// Typed wrapper over the compute API, scoped to one name prefix. Every
/// enumeration silently drops servers and keypairs outside the prefix;
/// nothing foreign is ever mutated.
#[derive(Clone)]
pub struct OpenStackClient {
    session: AsyncOpenStack,
    prefix: String,
    region: String,
}

impl OpenStackClient {
    #[instrument(skip(credentials), fields(auth_url = %credentials.auth_url, region = %credentials.region_name))]
    pub async fn connect(
        credentials: &OpenStackCredentials,
        prefix: String,
    ) -> Result<Self, CloudError> {
        let profile = serde_json::from_value(serde_json::json!({
            "auth": {
                "auth_url": credentials.auth_url,
                "username": credentials.username,
                "password": credentials.password,
                "project_name": credentials.project_name,
                "user_domain_name": credentials.user_domain_name,
                "project_domain_name": credentials.project_domain_name,
            },
            "region_name": credentials.region_name,
        }))
        .map_err(CloudError::Credentials)?;

        let mut session = AsyncOpenStack::new(&profile).await?;
        session
            .discover_service_endpoint(&ServiceType::Compute)
            .await?;

        Ok(Self {
            session,
            prefix,
            region: credentials.region_name.clone(),
        })
    }

    async fn session(&mut self) -> Result<&AsyncOpenStack, CloudError> {
        match self.session.get_auth_state(Some(TimeDelta::seconds(10))) {
            Some(AuthState::Expired) | Some(AuthState::AboutToExpire) => {
                tracing::debug!(region = %self.region, "refreshing openstack session");
                self.session.authorize(None, false, true).await?;
                self.session
                    .discover_service_endpoint(&ServiceType::Compute)
                    .await?;
            }
            _ => {}
        }

        Ok(&self.session)
    }

    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn list_instances(&mut self) -> Result<Vec<CloudInstance>, CloudError> {
        let prefix = self.prefix.clone();
        let session = self.session().await?;

        let ep = list_detailed::Request::builder().build()?;
        let servers: Vec<ListServerResponse> = ep.query_async(session).await.map_err(|e| {
            tracing::error!(error = %e, "failed to query server list");
            e
        })?;

        Ok(servers
            .iter()
            .filter_map(|server| to_cloud_instance(&prefix, server))
            .collect())
    }

    pub async fn get_instance(
        &mut self,
        name: &InstanceName,
    ) -> Result<Option<CloudInstance>, CloudError> {
        let instances = self.list_instances().await?;
        Ok(instances.into_iter().find(|i| &i.name == name))
    }

    /// Create the server and poll until the cloud reports it out of BUILD.
    /// On timeout or ERROR the partial server is deleted and the error
    /// surfaced; creation is never retried here.
    #[instrument(skip(self, user_data), fields(name = %name, image = %image, flavor = %flavor))]
    pub async fn launch_instance(
        &mut self,
        name: &InstanceName,
        image: &str,
        flavor: &str,
        network: &str,
        user_data: &str,
    ) -> Result<CloudInstance, CloudError> {
        let session = self.session().await?;

        let ep = create_20::Request::builder()
            .server(
                create_20::ServerBuilder::default()
                    .name(name.as_str())
                    .image_ref(image)
                    .flavor_ref(flavor)
                    .networks(vec![
                        create_20::NetworksBuilder::default().uuid(network).build()?,
                    ])
                    .key_name(name.as_str())
                    .user_data(Some(Cow::Owned(BASE64_STANDARD.encode(user_data))))
                    .build()?,
            )
            .build()?;

        let _created: CreateServerResponse = ep.query_async(session).await?;

        let deadline = tokio::time::Instant::now() + LAUNCH_TIMEOUT;
        loop {
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;

            match self.get_instance(name).await? {
                Some(instance) => match instance.state {
                    CloudRunnerState::Created => {}
                    CloudRunnerState::Error => {
                        tracing::error!(name = %name, "server errored during launch, reclaiming");
                        self.abandon_launch(name, &instance.server_id).await;
                        return Err(CloudError::LaunchFailed { name: name.clone() });
                    }
                    _ => {
                        tracing::info!(name = %name, "server is up");
                        return Ok(instance);
                    }
                },
                // Not listed yet; the create call may still be materializing.
                None => tracing::debug!(name = %name, "server not yet visible"),
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::error!(name = %name, "server stuck in BUILD, reclaiming");
                if let Ok(Some(instance)) = self.get_instance(name).await {
                    self.abandon_launch(name, &instance.server_id).await;
                }
                return Err(CloudError::LaunchTimeout { name: name.clone() });
            }
        }
    }

    async fn abandon_launch(&mut self, name: &InstanceName, server_id: &str) {
        if let Err(e) = self.delete_server(server_id).await {
            tracing::warn!(error = %e, name = %name, "failed to delete abandoned server");
        }
        if let Err(e) = self.delete_keypair(name).await {
            tracing::warn!(error = %e, name = %name, "failed to delete abandoned keypair");
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_server(&mut self, server_id: &str) -> Result<(), CloudError> {
        let session = self.session().await?;
        let ep = delete::Request::builder().id(server_id).build()?;
        api::ignore(ep).query_async(session).await?;
        Ok(())
    }

    /// Create a cloud-generated keypair named after the instance and return
    /// the private key material.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn create_keypair(&mut self, name: &InstanceName) -> Result<String, CloudError> {
        let session = self.session().await?;

        let ep = keypair_create::Request::builder()
            .keypair(
                keypair_create::KeypairBuilder::default()
                    .name(name.as_str())
                    .build()?,
            )
            .build()?;

        let keypair: KeypairResponse = ep.query_async(session).await?;
        keypair
            .private_key
            .ok_or_else(|| CloudError::MissingPrivateKey(name.to_string()))
    }

    #[instrument(skip(self), fields(name = %name))]
    pub async fn delete_keypair(&mut self, name: &InstanceName) -> Result<(), CloudError> {
        let session = self.session().await?;
        let ep = keypair_delete::Request::builder().id(name.as_str()).build()?;
        api::ignore(ep).query_async(session).await?;
        Ok(())
    }

    pub async fn list_keypair_names(&mut self) -> Result<Vec<InstanceName>, CloudError> {
        let prefix = self.prefix.clone();
        let session = self.session().await?;

        let ep = keypair_list::Request::builder().build()?;
        let entries: Vec<serde_json::Value> = ep.query_async(session).await?;

        Ok(entries
            .iter()
            .filter_map(|entry| {
                // The keypair listing nests each record under a "keypair"
                // envelope; tolerate both shapes.
                let record = entry.get("keypair").unwrap_or(entry);
                record.get("name").and_then(|n| n.as_str())
            })
            .filter_map(|raw| InstanceName::parse(&prefix, raw))
            .collect())
    }

    /// Reconcile the three key-related sets: on-disk keyfiles, cloud
    /// keypairs and live servers. Anything not backing a live server is
    /// deleted; servers and their keys are left alone.
    #[instrument(skip(self, keys), fields(prefix = %self.prefix))]
    pub async fn cleanup(&mut self, keys: &KeyStore) -> Result<(), CloudError> {
        let live: HashSet<InstanceName> = self
            .list_instances()
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();

        let mut removed_files = 0usize;
        for name in keys.list_keys(&self.prefix).map_err(CloudError::KeyStore)? {
            if !live.contains(&name) {
                match keys.delete_key(&name) {
                    Ok(()) => removed_files += 1,
                    Err(e) => tracing::warn!(error = %e, name = %name, "failed to remove stale keyfile"),
                }
            }
        }

        let mut removed_keypairs = 0usize;
        for name in self.list_keypair_names().await? {
            if !live.contains(&name) {
                match self.delete_keypair(&name).await {
                    Ok(()) => removed_keypairs += 1,
                    Err(e) => tracing::warn!(error = %e, name = %name, "failed to remove stale keypair"),
                }
            }
        }

        if removed_files + removed_keypairs > 0 {
            tracing::info!(
                stale_keyfiles = removed_files,
                stale_keypairs = removed_keypairs,
                "reconciled key material"
            );
        }

        Ok(())
    }
}

fn to_cloud_instance(prefix: &str, server: &ListServerResponse) -> Option<CloudInstance> {
    let name = InstanceName::parse(prefix, &server.name)?;

    let created_at = server.created.as_deref().and_then(parse_created);
    let state = CloudRunnerState::from_status(server.status.as_deref());

    Some(CloudInstance {
        name,
        server_id: server.id.clone(),
        addresses: extract_addresses(server),
        created_at,
        state,
    })
}

fn parse_created(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(error = %e, raw, "invalid server creation timestamp");
            None
        }
    }
}

// The addresses document is a map of network name to a list of address
// records; only the `addr` field matters here.
fn extract_addresses(server: &ListServerResponse) -> Vec<String> {
    let Ok(value) = serde_json::to_value(&server.addresses) else {
        return vec![];
    };

    let mut out = vec![];
    if let Some(networks) = value.as_object() {
        for entries in networks.values() {
            if let Some(records) = entries.as_array() {
                for record in records {
                    if let Some(addr) = record.get("addr").and_then(|a| a.as_str()) {
                        out.push(addr.to_string());
                    }
                }
            }
        }
    }
    out
}
