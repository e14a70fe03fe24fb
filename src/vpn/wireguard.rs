//! WireGuard / AmneziaWG peer provisioning
//!
//! Two server networks are managed side by side: `antizapret` (split
//! tunnel) and `vpn` (full tunnel). Each has a live server config under
//! `WIREGUARD_DIR` whose peer table is edited under a [`FileLock`], then
//! pushed to the running interface without a restart.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::backend::ProtocolManager;
use super::common::{self, TemplateVars};
use super::peer_table::{PeerBlock, PeerKeys, PeerTable};
use crate::artifacts::{today, ArtifactKind, ClientArtifacts, Protocol};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::ServerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::identity::ClientIdentity;
use crate::lock::FileLock;

/// Server-side WireGuard network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WgNetwork {
    Antizapret,
    Vpn,
}

impl WgNetwork {
    pub const ALL: [WgNetwork; 2] = [WgNetwork::Antizapret, WgNetwork::Vpn];

    /// Interface and config file stem
    pub fn name(self) -> &'static str {
        match self {
            WgNetwork::Antizapret => "antizapret",
            WgNetwork::Vpn => "vpn",
        }
    }

    /// Client profile kinds: plain WireGuard, then AmneziaWG
    fn profiles(self) -> [(&'static str, ArtifactKind); 2] {
        match self {
            WgNetwork::Antizapret => [
                ("wg", ArtifactKind::WireGuardAz),
                ("am", ArtifactKind::AmneziaAz),
            ],
            WgNetwork::Vpn => [
                ("wg", ArtifactKind::WireGuardGl),
                ("am", ArtifactKind::AmneziaGl),
            ],
        }
    }
}

/// Server key pair stored in `WIREGUARD_DIR/key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeys {
    pub private_key: String,
    pub public_key: String,
}

impl ServerKeys {
    pub fn parse(content: &str) -> ProvisionResult<Self> {
        let kv = common::parse_key_value_config(content);
        let field = |key: &str| {
            kv.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| ProvisionError::Parse(format!("{} missing from WireGuard key file", key)))
        };
        Ok(Self {
            private_key: field("PRIVATE_KEY")?,
            public_key: field("PUBLIC_KEY")?,
        })
    }

    fn render(&self) -> String {
        format!("PRIVATE_KEY={}\nPUBLIC_KEY={}\n", self.private_key, self.public_key)
    }
}

/// WireGuard/AmneziaWG provisioning over both server networks
pub struct WireGuardManager {
    config: Arc<ServerConfig>,
    runner: Arc<dyn CommandRunner>,
    artifacts: ClientArtifacts,
}

impl WireGuardManager {
    pub fn new(
        config: Arc<ServerConfig>,
        runner: Arc<dyn CommandRunner>,
        artifacts: ClientArtifacts,
    ) -> Self {
        Self {
            config,
            runner,
            artifacts,
        }
    }

    fn key_path(&self) -> PathBuf {
        self.config.wireguard_dir.join("key")
    }

    fn ips_path(&self) -> PathBuf {
        self.config.wireguard_dir.join("ips")
    }

    /// Live server config for `network`
    pub fn server_config_path(&self, network: WgNetwork) -> PathBuf {
        self.config
            .wireguard_dir
            .join(format!("{}.conf", network.name()))
    }

    fn template_path(&self, name: &str) -> PathBuf {
        self.config.wireguard_dir.join("templates").join(name)
    }

    async fn run_wg(&self, spec: CommandSpec) -> ProvisionResult<String> {
        let output = self.runner.run(&spec).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn generate_private_key(&self) -> ProvisionResult<String> {
        self.run_wg(CommandSpec::new("wg").arg("genkey")).await
    }

    async fn derive_public_key(&self, private_key: &str) -> ProvisionResult<String> {
        self.run_wg(CommandSpec::new("wg").arg("pubkey").stdin(private_key))
            .await
    }

    async fn generate_client_keys(&self) -> ProvisionResult<PeerKeys> {
        let private_key = self.generate_private_key().await?;
        let public_key = self.derive_public_key(&private_key).await?;
        let preshared_key = self.run_wg(CommandSpec::new("wg").arg("genpsk")).await?;
        Ok(PeerKeys {
            private_key,
            public_key,
            preshared_key,
        })
    }

    pub async fn read_server_keys(&self) -> ProvisionResult<ServerKeys> {
        let content = common::read_config_file(&self.key_path()).await?;
        ServerKeys::parse(&content)
    }

    /// Optional routed address list substituted as `${IPS}`
    async fn read_ips(&self) -> String {
        match tokio::fs::read_to_string(self.ips_path()).await {
            Ok(content) => content.trim().to_string(),
            Err(_) => String::new(),
        }
    }

    /// Push a changed config to the running interface
    ///
    /// Inactive interfaces are skipped; they pick the file up on next start.
    /// Returns whether a sync was performed.
    pub async fn sync(&self, network: WgNetwork) -> ProvisionResult<bool> {
        let iface = network.name();

        let probe = CommandSpec::new("systemctl")
            .args(["is-active", "--quiet"])
            .arg(format!("wg-quick@{}", iface));
        match self.runner.run(&probe).await {
            Ok(_) => {}
            Err(ProvisionError::CommandFailed { .. }) => {
                debug!("Interface {} is not active, skipping sync", iface);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let stripped = self
            .runner
            .run(&CommandSpec::new("wg-quick").args(["strip", iface]))
            .await?
            .stdout;

        self.runner
            .run(
                &CommandSpec::new("wg")
                    .args(["syncconf", iface, "/dev/stdin"])
                    .stdin(stripped),
            )
            .await?;

        info!("Synced WireGuard interface {}", iface);
        Ok(true)
    }

    async fn sync_logged(&self, network: WgNetwork) {
        if let Err(e) = self.sync(network).await {
            warn!("Failed to sync interface {}: {}", network.name(), e);
        }
    }

    /// Rewrite the peer table with a fresh block for `identity`
    async fn add_peer(&self, identity: &ClientIdentity, network: WgNetwork) -> ProvisionResult<(PeerKeys, Ipv4Addr)> {
        let conf_path = self.server_config_path(network);
        let _lock = FileLock::acquire(&conf_path).await?;

        let mut table = PeerTable::parse(&common::read_config_file(&conf_path).await?)?;
        if table.remove(identity) {
            info!("Client {} already exists in {}.conf, recreating", identity, network.name());
        }

        let keys = self.generate_client_keys().await?;
        let address = table.allocate_address(network.name())?;
        table.push(PeerBlock::new(identity, &keys, address));

        common::write_secure_config(&conf_path, &table.render(), 0o600).await?;
        Ok((keys, address))
    }

    async fn add_to_network(
        &self,
        identity: &ClientIdentity,
        network: WgNetwork,
        base_vars: &TemplateVars,
    ) -> ProvisionResult<()> {
        let (keys, address) = self.add_peer(identity, network).await?;
        info!("Added {} to {}.conf as {}", identity, network.name(), address);

        self.sync_logged(network).await;

        let mut vars = base_vars.clone();
        vars.insert("CLIENT_PRIVATE_KEY".into(), keys.private_key);
        vars.insert("CLIENT_PUBLIC_KEY".into(), keys.public_key);
        vars.insert("CLIENT_PRESHARED_KEY".into(), keys.preshared_key);
        vars.insert("CLIENT_IP".into(), address.to_string());

        let date = today();
        for (flavor, kind) in network.profiles() {
            let template = self.template_path(&format!("{}-client-{}.conf", network.name(), flavor));
            if !common::path_exists(&template).await {
                warn!("Client template {:?} not found, skipping", template);
                continue;
            }
            let content = common::render_template_file(&template, &vars).await?;
            self.artifacts.write(identity, kind, date, &content).await?;
        }
        Ok(())
    }

    /// Remove the identity's block from one network; true if it was present
    async fn remove_peer(&self, identity: &ClientIdentity, network: WgNetwork) -> ProvisionResult<bool> {
        let conf_path = self.server_config_path(network);
        if !common::path_exists(&conf_path).await {
            debug!("{:?} does not exist, nothing to remove", conf_path);
            return Ok(false);
        }

        let _lock = FileLock::acquire(&conf_path).await?;
        let mut table = PeerTable::parse(&common::read_config_file(&conf_path).await?)?;
        if !table.remove(identity) {
            return Ok(false);
        }
        common::write_secure_config(&conf_path, &table.render(), 0o600).await?;
        Ok(true)
    }
}

#[async_trait]
impl ProtocolManager for WireGuardManager {
    fn protocol(&self) -> Protocol {
        Protocol::WireGuard
    }

    /// Generate the server key pair and render both server configs once
    async fn init(&self) -> ProvisionResult<()> {
        common::ensure_directory_exists(&self.config.wireguard_dir).await?;

        if common::path_exists(&self.key_path()).await {
            debug!("WireGuard server keys already exist");
            return Ok(());
        }

        info!("Generating WireGuard server keys");
        let private_key = self.generate_private_key().await?;
        let public_key = self.derive_public_key(&private_key).await?;
        let keys = ServerKeys {
            private_key,
            public_key,
        };
        common::write_secure_config(&self.key_path(), &keys.render(), 0o600).await?;

        let mut vars = common::template_vars(&self.config);
        vars.insert("PRIVATE_KEY".into(), keys.private_key.clone());
        vars.insert("PUBLIC_KEY".into(), keys.public_key.clone());
        vars.insert("SERVER_IP".into(), self.config.server_host().unwrap_or_default().to_string());

        for network in WgNetwork::ALL {
            let template = self.template_path(&format!("{}.conf", network.name()));
            if !common::path_exists(&template).await {
                warn!("Server template {:?} not found, skipping", template);
                continue;
            }
            let content = common::render_template_file(&template, &vars).await?;
            common::write_secure_config(&self.server_config_path(network), &content, 0o600).await?;
            info!("Rendered server config {}.conf", network.name());
        }
        Ok(())
    }

    async fn add(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        self.artifacts.remove_by_extension(identity, &["conf"]).await?;

        let host = self.config.wireguard_host()?.to_string();
        let server = self.read_server_keys().await?;

        let mut vars = common::template_vars(&self.config);
        vars.insert("SERVER_HOST".into(), host);
        vars.insert("PUBLIC_KEY".into(), server.public_key);
        vars.insert("IPS".into(), self.read_ips().await);

        let mut first_failure = None;
        for network in WgNetwork::ALL {
            match self.add_to_network(identity, network, &vars).await {
                Ok(()) => {}
                Err(e) if e.is_contention() => return Err(e),
                Err(e) => {
                    error!("Failed to add {} to {}: {}", identity, network.name(), e);
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn delete(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        let mut found = false;

        for network in WgNetwork::ALL {
            match self.remove_peer(identity, network).await {
                Ok(true) => {
                    info!("Removed {} from {}.conf", identity, network.name());
                    found = true;
                    self.sync_logged(network).await;
                }
                Ok(false) => debug!("{} not present in {}.conf", identity, network.name()),
                Err(e) if e.is_contention() => return Err(e),
                Err(e) => error!("Failed to remove {} from {}: {}", identity, network.name(), e),
            }
        }

        if !found {
            return Err(ProvisionError::NotFound(format!("WireGuard client {}", identity)));
        }

        self.artifacts.remove_protocol(identity, Protocol::WireGuard).await?;
        Ok(())
    }
}
