//! Setup file loading
//!
//! The setup file is a flat `KEY=value` list with `#` comments and no
//! sections. It is read once at startup into an immutable [`ServerConfig`]
//! shared by every protocol manager.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ProvisionError, ProvisionResult};

pub const DEFAULT_SETUP_PATH: &str = "/root/antizapret/setup";

/// Immutable snapshot of the server's operational parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Every key from the setup file, also merged into template renders
    values: BTreeMap<String, String>,
    pub root_dir: PathBuf,
    pub easyrsa_dir: PathBuf,
    pub easyrsa_bin: PathBuf,
    pub openvpn_dir: PathBuf,
    pub wireguard_dir: PathBuf,
    pub client_base_dir: PathBuf,
    pub route_ips_file: PathBuf,
    pub xray_db_path: PathBuf,
    pub xray_api_host: String,
    pub xray_api_port: u16,
    pub xray_inbound_tag: String,
    /// First octet of the internal addressing scheme ("10" or "172")
    pub ip_prefix: &'static str,
}

impl ServerConfig {
    /// Load the setup file. A missing file is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> ProvisionResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ProvisionError::Config(format!(
                "Setup file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_values(parse_setup(&content))?;
        debug!("Loaded setup file {:?} ({} keys)", path, config.values.len());
        Ok(config)
    }

    /// Build a configuration from already-parsed key/value pairs
    pub fn from_values(values: BTreeMap<String, String>) -> ProvisionResult<Self> {
        let get = |key: &str, default: &str| -> String {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let root_dir = PathBuf::from(get("ROOT_DIR", "/root/antizapret"));
        let client_base_dir = values
            .get("CLIENT_BASE_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("client"));
        let route_ips_file = values
            .get("ROUTE_IPS_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("result").join("route-ips.txt"));
        let xray_db_path = values
            .get("XRAY_DB_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("xray.db"));

        let xray_api_port = get("XRAY_API_PORT", "10085").parse::<u16>().map_err(|e| {
            ProvisionError::Config(format!("Invalid XRAY_API_PORT: {}", e))
        })?;

        let ip_prefix = if get("ALTERNATIVE_IP", "n").eq_ignore_ascii_case("y") {
            "172"
        } else {
            "10"
        };

        Ok(Self {
            easyrsa_dir: PathBuf::from(get("EASYRSA_DIR", "/etc/openvpn/easyrsa3")),
            easyrsa_bin: PathBuf::from(get("EASYRSA_BIN", "/usr/share/easy-rsa/easyrsa")),
            openvpn_dir: PathBuf::from(get("OPENVPN_DIR", "/etc/openvpn")),
            wireguard_dir: PathBuf::from(get("WIREGUARD_DIR", "/etc/wireguard")),
            xray_api_host: get("XRAY_API_HOST", "127.0.0.1"),
            xray_inbound_tag: get("XRAY_INBOUND_TAG", "in-vless"),
            root_dir,
            client_base_dir,
            route_ips_file,
            xray_db_path,
            xray_api_port,
            ip_prefix,
            values,
        })
    }

    /// Raw lookup; empty values count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// All raw keys, used as the base layer of template variables
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn server_host(&self) -> Option<&str> {
        self.get("SERVER_HOST")
    }

    /// Host written into OpenVPN profiles
    pub fn openvpn_host(&self) -> ProvisionResult<&str> {
        self.get("OPENVPN_HOST")
            .or_else(|| self.server_host())
            .ok_or_else(|| ProvisionError::Config("Neither OPENVPN_HOST nor SERVER_HOST is set".into()))
    }

    /// Host written into WireGuard/AmneziaWG profiles
    pub fn wireguard_host(&self) -> ProvisionResult<&str> {
        self.get("WIREGUARD_HOST")
            .or_else(|| self.server_host())
            .ok_or_else(|| ProvisionError::Config("Neither WIREGUARD_HOST nor SERVER_HOST is set".into()))
    }

    /// VLESS/Reality parameters, `None` if any required key is missing
    pub fn vless(&self) -> Option<VlessParams> {
        Some(VlessParams {
            server_host: self.server_host()?.to_string(),
            public_key: self.get("VLESS_PUBLIC_KEY")?.to_string(),
            server_names: self.get("VLESS_SERVER_NAMES")?.to_string(),
            short_id: self.get("VLESS_SHORT_ID")?.to_string(),
            port: self
                .get("VLESS_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(443),
            link_name: self.get("VLESS_LINK_NAME").unwrap_or("VPN - Global").to_string(),
        })
    }
}

/// Reality connection parameters for generated VLESS configs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessParams {
    pub server_host: String,
    pub public_key: String,
    pub server_names: String,
    pub short_id: String,
    pub port: u16,
    pub link_name: String,
}

/// Parse `KEY=value` lines, skipping blanks and `#` comments
pub fn parse_setup(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_setup() {
        let values = parse_setup(
            "# comment\n\nSERVER_HOST=1.2.3.4\n  ALTERNATIVE_IP = y \nBROKEN LINE\nURL=a=b\n",
        );
        assert_eq!(values.get("SERVER_HOST").map(String::as_str), Some("1.2.3.4"));
        assert_eq!(values.get("ALTERNATIVE_IP").map(String::as_str), Some("y"));
        assert_eq!(values.get("URL").map(String::as_str), Some("a=b"));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = ServerConfig::load(dir.path().join("setup")).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_values(BTreeMap::new()).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/root/antizapret"));
        assert_eq!(config.client_base_dir, PathBuf::from("/root/antizapret/client"));
        assert_eq!(config.xray_api_port, 10085);
        assert_eq!(config.xray_inbound_tag, "in-vless");
        assert_eq!(config.ip_prefix, "10");
        assert!(config.openvpn_host().is_err());
        assert!(config.vless().is_none());
    }

    #[test]
    fn test_overrides() {
        let dir = TempDir::new().unwrap();
        let setup = dir.path().join("setup");
        std::fs::write(
            &setup,
            "ROOT_DIR=/srv/az\nALTERNATIVE_IP=Y\nSERVER_HOST=vpn.example\nOPENVPN_HOST=ovpn.example\n\
             XRAY_API_PORT=9000\nVLESS_PUBLIC_KEY=pk\nVLESS_SERVER_NAMES=sni.example\nVLESS_SHORT_ID=abcd\n",
        )
        .unwrap();

        let config = ServerConfig::load(&setup).unwrap();
        assert_eq!(config.client_base_dir, PathBuf::from("/srv/az/client"));
        assert_eq!(config.xray_db_path, PathBuf::from("/srv/az/xray.db"));
        assert_eq!(config.ip_prefix, "172");
        assert_eq!(config.xray_api_port, 9000);
        assert_eq!(config.openvpn_host().unwrap(), "ovpn.example");
        assert_eq!(config.wireguard_host().unwrap(), "vpn.example");

        let vless = config.vless().unwrap();
        assert_eq!(vless.port, 443);
        assert_eq!(vless.short_id, "abcd");
    }

    #[test]
    fn test_invalid_port() {
        let mut values = BTreeMap::new();
        values.insert("XRAY_API_PORT".to_string(), "not-a-port".to_string());
        assert!(ServerConfig::from_values(values).is_err());
    }
}
