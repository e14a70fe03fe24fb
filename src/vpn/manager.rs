use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::backend::ProtocolManager;
use super::openvpn::OpenVpnManager;
use super::wireguard::WireGuardManager;
use super::xray::{GrpcConnector, XrayConnector, XrayManager};
use crate::artifacts::{ArtifactKind, ClientArtifacts, Protocol};
use crate::command::{CommandRunner, SystemRunner};
use crate::config::ServerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::identity::ClientIdentity;
use crate::lock::LockRegistry;

/// Outcome of one protocol step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    /// Not attempted; the reason is logged and kept here
    Skipped(String),
    /// Delete found nothing to remove
    NotFound,
    Failed(String),
}

impl StepStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Done)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Done => f.write_str("done"),
            StepStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
            StepStatus::NotFound => f.write_str("not found"),
            StepStatus::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Per-protocol summary of a create or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub identity: ClientIdentity,
    pub openvpn: StepStatus,
    pub wireguard: StepStatus,
    pub xray: StepStatus,
}

impl ProvisionReport {
    fn new(identity: ClientIdentity) -> Self {
        let pending = || StepStatus::Skipped("not attempted".into());
        Self {
            identity,
            openvpn: pending(),
            wireguard: pending(),
            xray: pending(),
        }
    }

    pub fn status(&self, protocol: Protocol) -> &StepStatus {
        match protocol {
            Protocol::OpenVpn => &self.openvpn,
            Protocol::WireGuard => &self.wireguard,
            Protocol::Xray => &self.xray,
        }
    }

    /// Every protocol step succeeded
    pub fn is_complete(&self) -> bool {
        self.openvpn.is_done() && self.wireguard.is_done() && self.xray.is_done()
    }
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.identity)?;
        writeln!(f, "  OpenVPN:   {}", self.openvpn)?;
        writeln!(f, "  WireGuard: {}", self.wireguard)?;
        write!(f, "  Xray:      {}", self.xray)
    }
}

/// Classify a protocol step's result; only lock contention is fatal
fn settle(protocol: Protocol, identity: &ClientIdentity, result: ProvisionResult<()>) -> ProvisionResult<StepStatus> {
    match result {
        Ok(()) => Ok(StepStatus::Done),
        Err(e) if e.is_contention() => {
            error!("{} step for {} hit a held lock: {}", protocol, identity, e);
            Err(e)
        }
        Err(e) if e.is_not_found() => {
            info!("{} has nothing for {}: {}", protocol, identity, e);
            Ok(StepStatus::NotFound)
        }
        Err(ProvisionError::XrayUnavailable(reason)) => {
            warn!("Xray API unreachable, skipping {} for {}: {}", protocol, identity, reason);
            Ok(StepStatus::Skipped(reason))
        }
        Err(e) => {
            error!("{} step for {} failed: {}", protocol, identity, e);
            Ok(StepStatus::Failed(e.to_string()))
        }
    }
}

/// Entry point for provisioning a user across every protocol
///
/// OpenVPN work is serialized globally. WireGuard and Xray work is
/// serialized per identity, with WireGuard file edits additionally guarded
/// by cross-process file locks. A failure in one protocol never prevents the
/// next from running.
pub struct Provisioner {
    config: Arc<ServerConfig>,
    locks: LockRegistry,
    artifacts: ClientArtifacts,
    openvpn: Arc<dyn ProtocolManager>,
    wireguard: Arc<dyn ProtocolManager>,
    xray: Arc<dyn ProtocolManager>,
}

impl Provisioner {
    /// Real subprocesses and the configured Xray gRPC endpoint
    pub fn new(config: ServerConfig) -> Self {
        let connector = GrpcConnector::new(config.xray_api_host.clone(), config.xray_api_port);
        Self::with_runtime(Arc::new(config), Arc::new(SystemRunner::new()), Arc::new(connector))
    }

    pub fn with_runtime(
        config: Arc<ServerConfig>,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn XrayConnector>,
    ) -> Self {
        let artifacts = ClientArtifacts::new(config.client_base_dir.clone());
        let openvpn = OpenVpnManager::new(config.clone(), runner.clone(), artifacts.clone());
        let wireguard = WireGuardManager::new(config.clone(), runner, artifacts.clone());
        let xray = XrayManager::new(config.clone(), connector, artifacts.clone());
        Self::with_managers(config, Arc::new(openvpn), Arc::new(wireguard), Arc::new(xray))
    }

    pub fn with_managers(
        config: Arc<ServerConfig>,
        openvpn: Arc<dyn ProtocolManager>,
        wireguard: Arc<dyn ProtocolManager>,
        xray: Arc<dyn ProtocolManager>,
    ) -> Self {
        let artifacts = ClientArtifacts::new(config.client_base_dir.clone());
        Self {
            config,
            locks: LockRegistry::new(),
            artifacts,
            openvpn,
            wireguard,
            xray,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ClientArtifacts {
        &self.artifacts
    }

    /// Issue (or reissue) credentials for `user_id` on every protocol
    pub async fn create_user(&self, user_id: i64) -> ProvisionResult<ProvisionReport> {
        let identity = ClientIdentity::from_user_id(user_id);
        let mut report = ProvisionReport::new(identity.clone());
        info!("Creating user {}", identity);

        {
            let _pki = self.locks.openvpn().await;
            if let Err(e) = self.openvpn.init().await {
                error!("OpenVPN initialization failed, aborting create for {}: {}", identity, e);
                return Err(e);
            }
            report.openvpn = settle(self.openvpn.protocol(), &identity, self.openvpn.add(&identity).await)?;
        }

        let _user = self.locks.user(&identity).await;

        report.wireguard = match self.wireguard.init().await {
            Ok(()) => settle(self.wireguard.protocol(), &identity, self.wireguard.add(&identity).await)?,
            Err(e) => {
                error!("WireGuard initialization failed, skipping {}: {}", identity, e);
                StepStatus::Failed(e.to_string())
            }
        };

        report.xray = match self.xray.init().await {
            Ok(()) => settle(self.xray.protocol(), &identity, self.xray.add(&identity).await)?,
            Err(e) => {
                error!("Xray table unavailable, skipping {}: {}", identity, e);
                StepStatus::Failed(e.to_string())
            }
        };

        info!("Finished creating user {}", identity);
        Ok(report)
    }

    /// Revoke and remove everything provisioned for `user_id`
    pub async fn delete_user(&self, user_id: i64) -> ProvisionResult<ProvisionReport> {
        let identity = ClientIdentity::from_user_id(user_id);
        let mut report = ProvisionReport::new(identity.clone());
        info!("Deleting user {}", identity);

        {
            let _pki = self.locks.openvpn().await;
            report.openvpn = settle(self.openvpn.protocol(), &identity, self.openvpn.delete(&identity).await)?;
        }

        let _user = self.locks.user(&identity).await;
        report.wireguard = settle(self.wireguard.protocol(), &identity, self.wireguard.delete(&identity).await)?;
        report.xray = settle(self.xray.protocol(), &identity, self.xray.delete(&identity).await)?;

        if let Err(e) = self.artifacts.remove_dir_if_empty(&identity).await {
            warn!("Could not clean up directory for {}: {}", identity, e);
        }

        info!("Finished deleting user {}", identity);
        Ok(report)
    }

    /// Every artifact currently on disk for `user_id`
    pub async fn list_artifacts(&self, user_id: i64) -> ProvisionResult<Vec<(ArtifactKind, PathBuf)>> {
        self.artifacts.list(&ClientIdentity::from_user_id(user_id)).await
    }

    /// Newest artifact of `kind` for `user_id`
    pub async fn find_artifact(&self, user_id: i64, kind: ArtifactKind) -> ProvisionResult<Option<PathBuf>> {
        self.artifacts
            .find(&ClientIdentity::from_user_id(user_id), kind)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records calls and returns a canned result for `add`/`delete`
    struct Scripted {
        protocol: Protocol,
        init: Canned,
        step: Canned,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProtocolManager for Scripted {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn init(&self) -> ProvisionResult<()> {
            self.calls.lock().unwrap().push(format!("{}:init", self.protocol));
            (self.init)()
        }

        async fn add(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
            self.calls.lock().unwrap().push(format!("{}:add:{}", self.protocol, identity));
            (self.step)()
        }

        async fn delete(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
            self.calls.lock().unwrap().push(format!("{}:delete:{}", self.protocol, identity));
            (self.step)()
        }
    }

    fn ok() -> ProvisionResult<()> {
        Ok(())
    }

    fn no_easyrsa() -> ProvisionResult<()> {
        Err(ProvisionError::Config("no easyrsa".into()))
    }

    fn tool_failed() -> ProvisionResult<()> {
        Err(ProvisionError::CommandFailed {
            cmd: "wg genkey".into(),
            code: Some(1),
            stderr: String::new(),
        })
    }

    fn xray_down() -> ProvisionResult<()> {
        Err(ProvisionError::XrayUnavailable("refused".into()))
    }

    fn lock_held() -> ProvisionResult<()> {
        Err(ProvisionError::Contention {
            lock: PathBuf::from("/etc/wireguard/vpn.conf.lock"),
        })
    }

    fn missing() -> ProvisionResult<()> {
        Err(ProvisionError::NotFound("nothing".into()))
    }

    type Canned = fn() -> ProvisionResult<()>;

    fn provisioner(calls: &Arc<Mutex<Vec<String>>>, steps: [(Canned, Canned); 3]) -> Provisioner {
        let [o, w, x] = steps;
        let make = |protocol: Protocol, (init, step): (Canned, Canned)| -> Arc<dyn ProtocolManager> {
            Arc::new(Scripted {
                protocol,
                init,
                step,
                calls: calls.clone(),
            })
        };
        let mut values = BTreeMap::new();
        values.insert("CLIENT_BASE_DIR".to_string(), "/nonexistent/vpnprov-test".to_string());
        let config = Arc::new(ServerConfig::from_values(values).unwrap());
        Provisioner::with_managers(
            config,
            make(Protocol::OpenVpn, o),
            make(Protocol::WireGuard, w),
            make(Protocol::Xray, x),
        )
    }

    #[tokio::test]
    async fn test_create_runs_every_protocol_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let p = provisioner(&calls, [(ok, ok), (ok, ok), (ok, ok)]);

        let report = p.create_user(1001).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "OpenVPN:init",
                "OpenVPN:add:n1001",
                "WireGuard:init",
                "WireGuard:add:n1001",
                "Xray:init",
                "Xray:add:n1001",
            ]
        );
    }

    #[tokio::test]
    async fn test_pki_init_failure_is_fatal() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let p = provisioner(&calls, [(no_easyrsa, ok), (ok, ok), (ok, ok)]);

        assert!(p.create_user(1).await.is_err());
        assert_eq!(*calls.lock().unwrap(), vec!["OpenVPN:init"]);
    }

    #[tokio::test]
    async fn test_step_failures_do_not_stop_later_protocols() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let p = provisioner(&calls, [(ok, tool_failed), (tool_failed, ok), (ok, xray_down)]);

        let report = p.create_user(2).await.unwrap();
        assert!(matches!(report.openvpn, StepStatus::Failed(_)));
        assert!(matches!(report.wireguard, StepStatus::Failed(_)));
        assert_eq!(report.xray, StepStatus::Skipped("refused".into()));
        // WireGuard add is skipped when its init fails
        assert!(!calls.lock().unwrap().iter().any(|c| c == "WireGuard:add:n2"));
    }

    #[tokio::test]
    async fn test_contention_propagates() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let p = provisioner(&calls, [(ok, ok), (ok, lock_held), (ok, ok)]);

        assert!(p.create_user(3).await.unwrap_err().is_contention());
        assert!(!calls.lock().unwrap().iter().any(|c| c.starts_with("Xray")));
    }

    #[tokio::test]
    async fn test_delete_reports_not_found() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let p = provisioner(&calls, [(ok, missing), (ok, missing), (ok, ok)]);

        let report = p.delete_user(4).await.unwrap();
        assert_eq!(report.openvpn, StepStatus::NotFound);
        assert_eq!(report.wireguard, StepStatus::NotFound);
        assert_eq!(report.xray, StepStatus::Done);
        assert_eq!(
            report.to_string(),
            "n4:\n  OpenVPN:   not found\n  WireGuard: not found\n  Xray:      done"
        );
    }
}
