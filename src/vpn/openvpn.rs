//! OpenVPN client provisioning on top of an easyrsa PKI
//!
//! The PKI lives in `EASYRSA_DIR/pki` and is only ever mutated through the
//! easyrsa tool. Material the OpenVPN daemon reads (CA, server pair, CRL)
//! is copied into `OPENVPN_DIR/server/keys`; issued client pairs are copied
//! into `OPENVPN_DIR/client/keys`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::ProtocolManager;
use super::common;
use crate::artifacts::{today, ArtifactKind, ClientArtifacts, Protocol};
use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::config::ServerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::identity::ClientIdentity;

/// Common name of the server certificate
pub const SERVER_COMMON_NAME: &str = "antizapret-server";

const CA_COMMON_NAME: &str = "AntiZapret CA";

/// Validity of the CA, all issued certificates and the CRL
pub const DEFAULT_VALIDITY_DAYS: u32 = 3650;

/// Client profile templates, in `OPENVPN_DIR/client/templates`
const PROFILE_TEMPLATES: [(&str, ArtifactKind); 6] = [
    ("antizapret-udp.conf", ArtifactKind::OpenVpnAzUdp),
    ("antizapret-tcp.conf", ArtifactKind::OpenVpnAzTcp),
    ("antizapret.conf", ArtifactKind::OpenVpnAz),
    ("vpn-udp.conf", ArtifactKind::OpenVpnGlUdp),
    ("vpn-tcp.conf", ArtifactKind::OpenVpnGlTcp),
    ("vpn.conf", ArtifactKind::OpenVpnGl),
];

/// OpenVPN provisioning backed by easyrsa
pub struct OpenVpnManager {
    config: Arc<ServerConfig>,
    runner: Arc<dyn CommandRunner>,
    artifacts: ClientArtifacts,
    validity_days: u32,
}

impl OpenVpnManager {
    pub fn new(
        config: Arc<ServerConfig>,
        runner: Arc<dyn CommandRunner>,
        artifacts: ClientArtifacts,
    ) -> Self {
        Self {
            config,
            runner,
            artifacts,
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.config.easyrsa_dir.join("pki")
    }

    pub fn server_keys_dir(&self) -> PathBuf {
        self.config.openvpn_dir.join("server").join("keys")
    }

    pub fn client_keys_dir(&self) -> PathBuf {
        self.config.openvpn_dir.join("client").join("keys")
    }

    fn templates_dir(&self) -> PathBuf {
        self.config.openvpn_dir.join("client").join("templates")
    }

    fn issued(&self, name: &str) -> PathBuf {
        self.pki_dir().join("issued").join(format!("{}.crt", name))
    }

    fn private(&self, name: &str) -> PathBuf {
        self.pki_dir().join("private").join(format!("{}.key", name))
    }

    fn request(&self, name: &str) -> PathBuf {
        self.pki_dir().join("reqs").join(format!("{}.req", name))
    }

    /// Non-interactive easyrsa invocation rooted at `EASYRSA_DIR`
    fn easyrsa<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.config.easyrsa_bin.to_string_lossy())
            .arg("--batch")
            .args(args)
            .cwd(&self.config.easyrsa_dir)
    }

    async fn run(&self, spec: CommandSpec) -> ProvisionResult<CommandOutput> {
        debug!("Running {}", spec);
        self.runner.run(&spec).await
    }

    /// CA and server certificate both present
    pub async fn is_initialized(&self) -> bool {
        common::path_exists(&self.pki_dir().join("ca.crt")).await
            && common::path_exists(&self.issued(SERVER_COMMON_NAME)).await
    }

    async fn build_pki(&self) -> ProvisionResult<()> {
        info!("PKI not found or incomplete, initializing a new one");

        common::delete_directory(&self.pki_dir()).await?;
        common::delete_directory(&self.server_keys_dir()).await?;
        common::delete_directory(&self.client_keys_dir()).await?;

        let days = self.validity_days.to_string();
        let req_cn = format!("--req-cn={}", CA_COMMON_NAME);
        self.run(self.easyrsa(["init-pki"])).await?;
        self.run(
            self.easyrsa([req_cn.as_str(), "build-ca", "nopass"])
                .env("EASYRSA_CA_EXPIRE", &days),
        )
        .await?;
        self.run(
            self.easyrsa(["build-server-full", SERVER_COMMON_NAME, "nopass"])
                .env("EASYRSA_CERT_EXPIRE", &days),
        )
        .await?;

        info!("PKI initialized");
        Ok(())
    }

    /// Copy a PKI file into a serving directory unless already there
    async fn publish(&self, src: PathBuf, dest: PathBuf, mode: u32) -> ProvisionResult<()> {
        if common::path_exists(&dest).await {
            return Ok(());
        }
        common::copy_file(&src, &dest, Some(mode)).await?;
        debug!("Published {:?}", dest);
        Ok(())
    }

    /// Regenerate the CRL and copy it where the daemon reads it
    pub async fn refresh_crl(&self) -> ProvisionResult<()> {
        self.run(
            self.easyrsa(["gen-crl"])
                .env("EASYRSA_CRL_DAYS", self.validity_days.to_string()),
        )
        .await?;

        common::ensure_directory_exists(&self.server_keys_dir()).await?;
        common::copy_file(
            &self.pki_dir().join("crl.pem"),
            &self.server_keys_dir().join("crl.pem"),
            Some(0o644),
        )
        .await?;
        info!("Certificate revocation list updated");
        Ok(())
    }

    async fn revoke(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        self.run(self.easyrsa(["revoke", identity.as_str()])).await?;
        self.refresh_crl().await
    }

    /// Drop issued/private/request leftovers for `identity`
    async fn clear_pki_entry(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        common::delete_config_file(&self.issued(identity.as_str())).await?;
        common::delete_config_file(&self.private(identity.as_str())).await?;
        common::delete_config_file(&self.request(identity.as_str())).await
    }

    async fn issue(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        if common::path_exists(&self.issued(identity.as_str())).await {
            info!("Certificate for {} already exists, revoking before reissue", identity);
            self.revoke(identity).await?;
        }
        self.clear_pki_entry(identity).await?;

        self.run(
            self.easyrsa(["build-client-full", identity.as_str(), "nopass"])
                .env("EASYRSA_CERT_EXPIRE", self.validity_days.to_string()),
        )
        .await?;

        let keys = self.client_keys_dir();
        common::ensure_directory_exists(&keys).await?;
        common::copy_file(
            &self.issued(identity.as_str()),
            &keys.join(format!("{}.crt", identity)),
            Some(0o644),
        )
        .await?;
        common::copy_file(
            &self.private(identity.as_str()),
            &keys.join(format!("{}.key", identity)),
            Some(0o600),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolManager for OpenVpnManager {
    fn protocol(&self) -> Protocol {
        Protocol::OpenVpn
    }

    async fn init(&self) -> ProvisionResult<()> {
        common::ensure_directory_exists(&self.config.easyrsa_dir).await?;

        if self.is_initialized().await {
            debug!("OpenVPN PKI already initialized");
        } else {
            self.build_pki().await?;
        }

        let server_keys = self.server_keys_dir();
        common::ensure_directory_exists(&server_keys).await?;
        common::ensure_directory_exists(&self.client_keys_dir()).await?;

        self.publish(self.pki_dir().join("ca.crt"), server_keys.join("ca.crt"), 0o644)
            .await?;
        self.publish(
            self.issued(SERVER_COMMON_NAME),
            server_keys.join(format!("{}.crt", SERVER_COMMON_NAME)),
            0o644,
        )
        .await?;
        self.publish(
            self.private(SERVER_COMMON_NAME),
            server_keys.join(format!("{}.key", SERVER_COMMON_NAME)),
            0o600,
        )
        .await?;

        if !common::path_exists(&server_keys.join("crl.pem")).await {
            self.refresh_crl().await?;
        }
        Ok(())
    }

    async fn add(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        self.artifacts.remove_by_extension(identity, &["ovpn"]).await?;
        let host = self.config.openvpn_host()?.to_string();

        self.issue(identity).await?;

        let ca = common::read_config_file(&self.server_keys_dir().join("ca.crt")).await?;
        let cert = common::read_config_file(&self.client_keys_dir().join(format!("{}.crt", identity))).await?;
        let key = common::read_config_file(&self.client_keys_dir().join(format!("{}.key", identity))).await?;

        let ca_pem = common::extract_pem_certificate(&ca).unwrap_or_default();
        let cert_pem = common::extract_pem_certificate(&cert).unwrap_or_default();
        let key = key.trim();
        if ca_pem.is_empty() || cert_pem.is_empty() || key.is_empty() {
            return Err(ProvisionError::Parse(format!(
                "Cannot load PEM material for {}",
                identity
            )));
        }

        let mut vars = common::template_vars(&self.config);
        vars.insert("SERVER_HOST".into(), host);
        vars.insert(
            "SERVER_IP".into(),
            self.config.server_host().unwrap_or_default().to_string(),
        );
        vars.insert("CA_CERT".into(), ca_pem.to_string());
        vars.insert("CLIENT_CERT".into(), cert_pem.to_string());
        vars.insert("CLIENT_KEY".into(), key.to_string());

        let date = today();
        let mut written = 0;
        for (name, kind) in PROFILE_TEMPLATES {
            let template = self.templates_dir().join(name);
            if !common::path_exists(&template).await {
                warn!("OpenVPN template {:?} not found, skipping", template);
                continue;
            }
            let content = common::render_template_file(&template, &vars).await?;
            self.artifacts.write(identity, kind, date, &content).await?;
            written += 1;
        }

        info!("OpenVPN client {} issued, {} profile(s) written", identity, written);
        Ok(())
    }

    async fn delete(&self, identity: &ClientIdentity) -> ProvisionResult<()> {
        let issued = common::path_exists(&self.issued(identity.as_str())).await;
        if issued {
            self.revoke(identity).await?;
        }

        // Leftovers are cleared even when the PKI has no certificate
        let keys = self.client_keys_dir();
        common::delete_config_file(&keys.join(format!("{}.crt", identity))).await?;
        common::delete_config_file(&keys.join(format!("{}.key", identity))).await?;
        let removed = self.artifacts.remove_protocol(identity, Protocol::OpenVpn).await?;

        if !issued {
            if removed > 0 {
                info!("Removed {} stale OpenVPN profiles for {}", removed, identity);
            }
            return Err(ProvisionError::NotFound(format!("OpenVPN certificate {}", identity)));
        }

        info!("OpenVPN client {} revoked", identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----";

    struct Fixture {
        _dir: TempDir,
        config: Arc<ServerConfig>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut values = BTreeMap::new();
        values.insert("SERVER_HOST".to_string(), "203.0.113.7".to_string());
        for (key, sub) in [
            ("EASYRSA_DIR", "easyrsa"),
            ("OPENVPN_DIR", "openvpn"),
            ("CLIENT_BASE_DIR", "client"),
        ] {
            values.insert(key.to_string(), dir.path().join(sub).display().to_string());
        }
        let config = Arc::new(ServerConfig::from_values(values).unwrap());

        let templates = config.openvpn_dir.join("client/templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("antizapret-udp.conf"),
            "remote ${SERVER_HOST} 1194 udp\n<ca>\n${CA_CERT}\n</ca>\n<cert>\n${CLIENT_CERT}\n</cert>\n<key>\n${CLIENT_KEY}\n</key>\n",
        )
        .unwrap();

        Fixture { _dir: dir, config }
    }

    /// Pretend PKI: writes the files easyrsa would produce
    fn fake_easyrsa(pki: PathBuf) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |spec| {
            let args: Vec<&str> = spec.arguments().iter().map(String::as_str).collect();
            let write = |rel: String, content: &str| {
                let path = pki.join(rel);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, content).unwrap();
            };
            match args.as_slice() {
                ["--batch", "init-pki"] => std::fs::create_dir_all(&pki).unwrap(),
                [.., "build-ca", "nopass"] => write("ca.crt".into(), PEM),
                [.., "build-server-full", name, "nopass"] | [.., "build-client-full", name, "nopass"] => {
                    write(format!("issued/{}.crt", name), &format!("Certificate:\n{}\n", PEM));
                    write(format!("private/{}.key", name), "PRIVATE KEY");
                }
                ["--batch", "revoke", name] => {
                    std::fs::remove_file(pki.join(format!("issued/{}.crt", name))).unwrap();
                }
                ["--batch", "gen-crl"] => write("crl.pem".into(), "CRL"),
                other => panic!("unexpected easyrsa call {:?}", other),
            }
            Ok(CommandOutput::default())
        });
        runner
    }

    fn manager(fx: &Fixture, runner: MockCommandRunner) -> OpenVpnManager {
        OpenVpnManager::new(
            fx.config.clone(),
            Arc::new(runner),
            ClientArtifacts::new(fx.config.client_base_dir.clone()),
        )
    }

    #[tokio::test]
    async fn test_init_builds_and_publishes_pki() {
        let fx = fixture();
        let ovpn = manager(&fx, fake_easyrsa(fx.config.easyrsa_dir.join("pki")));

        ovpn.init().await.unwrap();
        assert!(ovpn.is_initialized().await);
        for name in ["ca.crt", "antizapret-server.crt", "antizapret-server.key", "crl.pem"] {
            assert!(ovpn.server_keys_dir().join(name).exists(), "{} missing", name);
        }

        // Already initialized: no further tool calls
        let ovpn = manager(&fx, MockCommandRunner::new());
        ovpn.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_renders_profiles_and_reissues() {
        let fx = fixture();
        let ovpn = manager(&fx, fake_easyrsa(fx.config.easyrsa_dir.join("pki")));
        let id = ClientIdentity::from_user_id(1001);

        ovpn.init().await.unwrap();
        ovpn.add(&id).await.unwrap();

        let profile = ovpn
            .artifacts
            .find(&id, ArtifactKind::OpenVpnAzUdp)
            .await
            .unwrap()
            .unwrap();
        let content = std::fs::read_to_string(profile).unwrap();
        assert!(content.starts_with("remote 203.0.113.7 1194 udp\n<ca>\n-----BEGIN CERTIFICATE-----"));
        assert!(!content.contains("Certificate:"));
        assert!(content.contains("<key>\nPRIVATE KEY\n</key>"));

        // Second add revokes and reissues; still exactly one profile
        ovpn.add(&id).await.unwrap();
        assert_eq!(ovpn.artifacts.list(&id).await.unwrap().len(), 1);

        ovpn.delete(&id).await.unwrap();
        assert!(ovpn.artifacts.list(&id).await.unwrap().is_empty());
        assert!(!ovpn.client_keys_dir().join("n1001.crt").exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let fx = fixture();
        let ovpn = manager(&fx, MockCommandRunner::new());
        let err = ovpn.delete(&ClientIdentity::from_user_id(5)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_without_certificate_clears_leftovers() {
        let fx = fixture();
        let ovpn = manager(&fx, MockCommandRunner::new());
        let id = ClientIdentity::from_user_id(5);

        let client_dir = fx.config.client_base_dir.join("n5");
        std::fs::create_dir_all(&client_dir).unwrap();
        let profile = client_dir.join(ArtifactKind::OpenVpnGl.file_name(today()));
        std::fs::write(&profile, "stale").unwrap();
        std::fs::create_dir_all(ovpn.client_keys_dir()).unwrap();
        std::fs::write(ovpn.client_keys_dir().join("n5.crt"), "stale").unwrap();

        let err = ovpn.delete(&id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!profile.exists());
        assert!(!ovpn.client_keys_dir().join("n5.crt").exists());
        assert!(ovpn.artifacts.remove_dir_if_empty(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_tool_failure_aborts_init() {
        let fx = fixture();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|spec| {
            Err(ProvisionError::CommandFailed {
                cmd: spec.to_string(),
                code: Some(1),
                stderr: "easyrsa: not found".into(),
            })
        });
        let ovpn = manager(&fx, runner);

        assert!(matches!(ovpn.init().await, Err(ProvisionError::CommandFailed { .. })));
        assert!(!ovpn.is_initialized().await);
    }
}
