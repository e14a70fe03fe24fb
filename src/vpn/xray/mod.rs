//! VLESS/Xray user provisioning
//!
//! Users live in two places: the durable SQLite table and the running Xray
//! process, which is mutated through its management API. No server config
//! file is ever rewritten.

pub mod api;
pub mod profile;
pub mod proto;
pub mod store;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::ProtocolManager;
use crate::artifacts::{today, ArtifactKind, ClientArtifacts, Protocol};
use crate::config::ServerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::identity::ClientIdentity;

pub use api::{GrpcConnector, XrayApi, XrayConnector};
pub use profile::VLESS_FLOW;
pub use store::{UserStore, XrayUser};

const PROFILE_EXTENSIONS: [&str; 2] = ["json", "txt"];

pub struct XrayManager {
    config: Arc<ServerConfig>,
    store: UserStore,
    connector: Arc<dyn XrayConnector>,
    artifacts: ClientArtifacts,
}

impl XrayManager {
    pub fn new(
        config: Arc<ServerConfig>,
        connector: Arc<dyn XrayConnector>,
        artifacts: ClientArtifacts,
    ) -> Self {
        let store = UserStore::new(config.xray_db_path.clone());
        Self {
            config,
            store,
            connector,
            artifacts,
        }
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    async fn write_profiles(&self, identity: &ClientIdentity, uuid: &str) -> ProvisionResult<()> {
        let Some(params) = self.config.vless() else {
            warn!("VLESS parameters missing from setup, skipping profile generation for {}", identity);
            return Ok(());
        };

        let date = today();
        let routes = profile::read_route_ips(&self.config.route_ips_file).await;
        let config = profile::client_config(uuid, &params, self.config.ip_prefix, &routes);
        let path = self
            .artifacts
            .write(identity, ArtifactKind::XrayJson, date, &profile::to_pretty_json(&config)?)
            .await?;
        info!("Xray client config saved to {:?}", path);

        let link = profile::vless_link(uuid, &params)?;
        let path = self
            .artifacts
            .write(identity, ArtifactKind::XrayLink, date, &link)
            .await?;
        info!("VLESS link saved to {:?}", path);
        Ok(())
    }
}

#[async_trait]
impl ProtocolManager for XrayManager {
    fn protocol(&self) -> Protocol {
        Protocol::Xray
    }

    async fn init(&self) -> ProvisionResult<()> {
        self.store.ensure_table().await
    }

    async fn add(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        let api = self.connector.connect().await?;
        let tag = self.config.xray_inbound_tag.as_str();
        let email = identity.as_str();

        let uuid = match self.store.find_by_email(email).await? {
            Some(user) => {
                info!("Xray user {} exists, recreating client and profiles", identity);
                self.artifacts.remove_by_extension(identity, &PROFILE_EXTENSIONS).await?;
                match api.remove_client(tag, email).await {
                    Ok(()) => {}
                    Err(ProvisionError::XrayRejected(msg)) => {
                        debug!("Xray had no live user {}: {}", identity, msg)
                    }
                    Err(e) => return Err(e),
                }
                user.uuid
            }
            None => {
                let user = XrayUser {
                    uuid: Uuid::new_v4().to_string(),
                    email: email.to_string(),
                };
                if !self.store.insert(&user).await? {
                    return Err(ProvisionError::XrayRejected(format!(
                        "user {} could not be recorded",
                        identity
                    )));
                }
                info!("Created Xray user {} with id {}", identity, user.uuid);
                user.uuid
            }
        };

        if let Err(e) = api.add_client(tag, &uuid, email, VLESS_FLOW).await {
            warn!("Failed to add {} to Xray, it may already exist: {}", identity, e);
            return Err(e);
        }
        info!("User {} added to Xray inbound {}", identity, tag);

        self.write_profiles(identity, &uuid).await
    }

    async fn delete(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        let api = self.connector.connect().await?;
        let email = identity.as_str();

        if self.store.find_by_email(email).await?.is_none() {
            return Err(ProvisionError::NotFound(format!("Xray user {}", identity)));
        }

        // Local state is removed even if the live instance refuses
        if let Err(e) = api.remove_client(&self.config.xray_inbound_tag, email).await {
            warn!("Failed to remove {} from Xray: {}", identity, e);
        }

        self.store.delete_by_email(email).await?;
        self.artifacts.remove_by_extension(identity, &PROFILE_EXTENSIONS).await?;
        info!("Xray user {} removed", identity);
        Ok(())
    }
}
