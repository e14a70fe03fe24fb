//! Shared fixtures for integration tests
//!
//! `FakeTools` answers easyrsa, wg, wg-quick and systemctl invocations by
//! writing the files the real tools would; `FakeXray` keeps live users in
//! memory and can be switched off to simulate an unreachable API.

#![allow(dead_code)]

use async_trait::async_trait;
use libvpnprov::{
    ArtifactKind, CommandOutput, CommandRunner, CommandSpec, ProvisionError, ProvisionResult,
    Provisioner, ServerConfig, XrayApi, XrayConnector,
};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBfake\n-----END CERTIFICATE-----";

pub struct FakeTools {
    pki: PathBuf,
    wireguard: PathBuf,
    counter: AtomicUsize,
    pub active_interfaces: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTools {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            pki: config.easyrsa_dir.join("pki"),
            wireguard: config.wireguard_dir.clone(),
            counter: AtomicUsize::new(0),
            active_interfaces: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn write_pki(&self, rel: &str, content: &str) -> ProvisionResult<()> {
        let path = self.pki.join(rel);
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn easyrsa(&self, args: &[&str]) -> ProvisionResult<CommandOutput> {
        match args {
            ["--batch", "init-pki"] => std::fs::create_dir_all(&self.pki)?,
            [.., "build-ca", "nopass"] => self.write_pki("ca.crt", PEM)?,
            [.., "build-server-full", name, "nopass"] | [.., "build-client-full", name, "nopass"] => {
                let serial = self.counter.fetch_add(1, Ordering::SeqCst);
                self.write_pki(
                    &format!("issued/{}.crt", name),
                    &format!("Certificate:\n    Serial: {}\n{}\n", serial, PEM),
                )?;
                self.write_pki(&format!("private/{}.key", name), &format!("KEY-{}-{}", name, serial))?;
                self.write_pki(&format!("reqs/{}.req", name), "REQ")?;
            }
            ["--batch", "revoke", name] => {
                let issued = self.pki.join(format!("issued/{}.crt", name));
                if !issued.exists() {
                    return Err(failed(args, "Unable to revoke as no certificate was found"));
                }
                let revoked = self.pki.join("revoked");
                std::fs::create_dir_all(&revoked)?;
                std::fs::rename(issued, revoked.join(format!("{}.crt", name)))?;
            }
            ["--batch", "gen-crl"] => self.write_pki("crl.pem", "CRL")?,
            _ => return Err(failed(args, "unknown easyrsa command")),
        }
        Ok(CommandOutput::default())
    }

    fn wg(&self, args: &[&str], input: Option<&str>) -> ProvisionResult<CommandOutput> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let out = match args {
            ["genkey"] => format!("priv{}=\n", n),
            ["pubkey"] => format!("pub-{}\n", input.unwrap_or_default().trim()),
            ["genpsk"] => format!("psk{}=\n", n),
            ["syncconf", _, "/dev/stdin"] => String::new(),
            _ => return Err(failed(args, "unknown wg command")),
        };
        Ok(CommandOutput::new(out))
    }
}

fn failed(args: &[&str], stderr: &str) -> ProvisionError {
    ProvisionError::CommandFailed {
        cmd: args.join(" "),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandRunner for FakeTools {
    async fn run(&self, spec: &CommandSpec) -> ProvisionResult<CommandOutput> {
        self.calls.lock().unwrap().push(spec.to_string());
        let args: Vec<&str> = spec.arguments().iter().map(String::as_str).collect();

        match spec.program() {
            p if p.ends_with("easyrsa") => self.easyrsa(&args),
            "wg" => self.wg(&args, spec.input()),
            "systemctl" => {
                let unit = args.last().copied().unwrap_or_default();
                let iface = unit.trim_start_matches("wg-quick@");
                if self.active_interfaces.lock().unwrap().contains(iface) {
                    Ok(CommandOutput::default())
                } else {
                    Err(ProvisionError::CommandFailed {
                        cmd: spec.to_string(),
                        code: Some(3),
                        stderr: String::new(),
                    })
                }
            }
            "wg-quick" => {
                let conf = self.wireguard.join(format!("{}.conf", args[1]));
                Ok(CommandOutput::new(std::fs::read_to_string(conf)?))
            }
            _ => Err(failed(&args, "command not found")),
        }
    }
}

#[derive(Default)]
pub struct FakeXray {
    pub down: AtomicBool,
    pub users: Arc<Mutex<HashSet<String>>>,
}

struct FakeXraySession {
    users: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl XrayConnector for FakeXray {
    async fn connect(&self) -> ProvisionResult<Box<dyn XrayApi>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ProvisionError::XrayUnavailable("connection refused".into()));
        }
        Ok(Box::new(FakeXraySession {
            users: self.users.clone(),
        }))
    }
}

#[async_trait]
impl XrayApi for FakeXraySession {
    async fn add_client(&self, _tag: &str, _uuid: &str, email: &str, _flow: &str) -> ProvisionResult<()> {
        if !self.users.lock().unwrap().insert(email.to_string()) {
            return Err(ProvisionError::XrayRejected(format!("User {} already exists.", email)));
        }
        Ok(())
    }

    async fn remove_client(&self, _tag: &str, email: &str) -> ProvisionResult<()> {
        if !self.users.lock().unwrap().remove(email) {
            return Err(ProvisionError::XrayRejected(format!("User {} not found.", email)));
        }
        Ok(())
    }
}

/// A complete server tree in a temp directory
pub struct Server {
    pub dir: TempDir,
    pub config: Arc<ServerConfig>,
    pub tools: Arc<FakeTools>,
    pub xray: Arc<FakeXray>,
    pub provisioner: Provisioner,
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn setup_values(root: &Path) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let path = |sub: &str| root.join(sub).display().to_string();
    for (key, value) in [
        ("ROOT_DIR", path("antizapret")),
        ("EASYRSA_DIR", path("easyrsa3")),
        ("EASYRSA_BIN", "easyrsa".to_string()),
        ("OPENVPN_DIR", path("openvpn")),
        ("WIREGUARD_DIR", path("wireguard")),
        ("SERVER_HOST", "203.0.113.7".to_string()),
        ("VLESS_PUBLIC_KEY", "reality-pbk".to_string()),
        ("VLESS_SERVER_NAMES", "www.example.com".to_string()),
        ("VLESS_SHORT_ID", "0a1b".to_string()),
    ] {
        values.insert(key.to_string(), value);
    }
    values
}

/// Templates the server ships with
pub fn write_templates(config: &ServerConfig) {
    let ovpn = config.openvpn_dir.join("client/templates");
    for name in [
        "antizapret-udp",
        "antizapret-tcp",
        "antizapret",
        "vpn-udp",
        "vpn-tcp",
        "vpn",
    ] {
        write(
            &ovpn.join(format!("{}.conf", name)),
            &format!(
                "# {}\nremote ${{SERVER_HOST}} 1194\n<ca>\n${{CA_CERT}}\n</ca>\n<cert>\n${{CLIENT_CERT}}\n</cert>\n<key>\n${{CLIENT_KEY}}\n</key>\n${{UNSET_VAR}}",
                name
            ),
        );
    }

    let wg = config.wireguard_dir.join("templates");
    for (net, octet) in [("antizapret", 29), ("vpn", 28)] {
        write(
            &wg.join(format!("{}.conf", net)),
            &format!(
                "[Interface]\nPrivateKey = ${{PRIVATE_KEY}}\nAddress = 10.{}.8.1/24\nListenPort = 51443\n",
                octet
            ),
        );
        for flavor in ["wg", "am"] {
            write(
                &wg.join(format!("{}-client-{}.conf", net, flavor)),
                "[Interface]\nPrivateKey = ${CLIENT_PRIVATE_KEY}\nAddress = ${CLIENT_IP}/32\n\n\
                 [Peer]\nPublicKey = ${PUBLIC_KEY}\nPresharedKey = ${CLIENT_PRESHARED_KEY}\n\
                 Endpoint = ${SERVER_HOST}:51443\n",
            );
        }
    }

    write(&config.route_ips_file, "198.51.100.0/24\n\n192.0.2.0/24\n");
}

pub fn server() -> Server {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(ServerConfig::from_values(setup_values(dir.path())).unwrap());
    write_templates(&config);

    let tools = Arc::new(FakeTools::new(&config));
    let xray = Arc::new(FakeXray::default());
    let provisioner = Provisioner::with_runtime(config.clone(), tools.clone(), xray.clone());

    Server {
        dir,
        config,
        tools,
        xray,
        provisioner,
    }
}

impl Server {
    pub fn client_dir(&self, user_id: i64) -> PathBuf {
        self.config.client_base_dir.join(format!("n{}", user_id))
    }

    pub fn files(&self, user_id: i64) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(self.client_dir(user_id)) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    pub fn server_conf(&self, network: &str) -> String {
        std::fs::read_to_string(self.config.wireguard_dir.join(format!("{}.conf", network))).unwrap()
    }

    pub fn artifact(&self, user_id: i64, kind: ArtifactKind) -> String {
        let path = self
            .client_dir(user_id)
            .join(kind.file_name(libvpnprov::artifacts::today()));
        std::fs::read_to_string(path).unwrap()
    }
}
