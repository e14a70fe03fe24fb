//! Client artifact directories
//!
//! Each identity owns `<CLIENT_BASE_DIR>/<identity>/`, holding dated,
//! prefix-tagged profile files that the bot layer delivers to users.
//! Files are regenerated wholesale on every create, never patched.

use chrono::{Local, NaiveDate};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ProvisionResult;
use crate::identity::ClientIdentity;
use crate::vpn::common;

/// Owning protocol of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    OpenVpn,
    WireGuard,
    Xray,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Protocol::OpenVpn => "OpenVPN",
            Protocol::WireGuard => "WireGuard",
            Protocol::Xray => "Xray",
        })
    }
}

/// The twelve artifact families produced per identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    OpenVpnAzUdp,
    OpenVpnAzTcp,
    OpenVpnAz,
    OpenVpnGlUdp,
    OpenVpnGlTcp,
    OpenVpnGl,
    WireGuardAz,
    AmneziaAz,
    WireGuardGl,
    AmneziaGl,
    XrayJson,
    XrayLink,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 12] = [
        ArtifactKind::OpenVpnAzUdp,
        ArtifactKind::OpenVpnAzTcp,
        ArtifactKind::OpenVpnAz,
        ArtifactKind::OpenVpnGlUdp,
        ArtifactKind::OpenVpnGlTcp,
        ArtifactKind::OpenVpnGl,
        ArtifactKind::WireGuardAz,
        ArtifactKind::AmneziaAz,
        ArtifactKind::WireGuardGl,
        ArtifactKind::AmneziaGl,
        ArtifactKind::XrayJson,
        ArtifactKind::XrayLink,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::OpenVpnAzUdp => "AZ-UDP",
            ArtifactKind::OpenVpnAzTcp => "AZ-TCP",
            ArtifactKind::OpenVpnAz => "AZ-U+T",
            ArtifactKind::OpenVpnGlUdp => "GL-UDP",
            ArtifactKind::OpenVpnGlTcp => "GL-TCP",
            ArtifactKind::OpenVpnGl => "GL-U+T",
            ArtifactKind::WireGuardAz => "AZ-WG",
            ArtifactKind::AmneziaAz => "AZ-AM",
            ArtifactKind::WireGuardGl => "GL-WG",
            ArtifactKind::AmneziaGl => "GL-AM",
            ArtifactKind::XrayJson => "AZ-XR",
            ArtifactKind::XrayLink => "GL-XR",
        }
    }

    pub fn extension(self) -> &'static str {
        match self.protocol() {
            Protocol::OpenVpn => "ovpn",
            Protocol::WireGuard => "conf",
            Protocol::Xray => match self {
                ArtifactKind::XrayJson => "json",
                _ => "txt",
            },
        }
    }

    pub fn protocol(self) -> Protocol {
        match self {
            ArtifactKind::OpenVpnAzUdp
            | ArtifactKind::OpenVpnAzTcp
            | ArtifactKind::OpenVpnAz
            | ArtifactKind::OpenVpnGlUdp
            | ArtifactKind::OpenVpnGlTcp
            | ArtifactKind::OpenVpnGl => Protocol::OpenVpn,
            ArtifactKind::WireGuardAz
            | ArtifactKind::AmneziaAz
            | ArtifactKind::WireGuardGl
            | ArtifactKind::AmneziaGl => Protocol::WireGuard,
            ArtifactKind::XrayJson | ArtifactKind::XrayLink => Protocol::Xray,
        }
    }

    pub fn for_protocol(protocol: Protocol) -> impl Iterator<Item = ArtifactKind> {
        Self::ALL.into_iter().filter(move |k| k.protocol() == protocol)
    }

    /// `<PREFIX>-<YY-MM-DD>.<ext>`
    pub fn file_name(self, date: NaiveDate) -> String {
        format!("{}-{}.{}", self.prefix(), date.format("%y-%m-%d"), self.extension())
    }

    /// Whether `name` is a (dated) file of this kind
    pub fn matches(self, name: &str) -> bool {
        name.strip_prefix(self.prefix())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|rest| rest.ends_with(&format!(".{}", self.extension())))
    }

    /// Classify a file name
    pub fn from_file_name(name: &str) -> Option<ArtifactKind> {
        Self::ALL.into_iter().find(|k| k.matches(name))
    }
}

/// Today's date in the server's local time zone
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Filesystem view over `<CLIENT_BASE_DIR>`
#[derive(Debug, Clone)]
pub struct ClientArtifacts {
    base_dir: PathBuf,
}

impl ClientArtifacts {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn dir(&self, identity: &ClientIdentity) -> PathBuf {
        self.base_dir.join(identity.as_str())
    }

    /// Write one artifact dated `date`, creating the directory as needed
    pub async fn write(
        &self,
        identity: &ClientIdentity,
        kind: ArtifactKind,
        date: NaiveDate,
        content: &str,
    ) -> ProvisionResult<PathBuf> {
        let dir = self.dir(identity);
        common::ensure_directory_exists(&dir).await?;
        let path = dir.join(kind.file_name(date));
        common::write_secure_config(&path, content, 0o600).await?;
        debug!("Wrote artifact {:?}", path);
        Ok(path)
    }

    /// File names in the identity's directory, sorted; empty if absent
    async fn file_names(&self, identity: &ClientIdentity) -> ProvisionResult<Vec<String>> {
        let dir = self.dir(identity);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove every file whose name ends in one of `extensions`
    pub async fn remove_by_extension(
        &self,
        identity: &ClientIdentity,
        extensions: &[&str],
    ) -> ProvisionResult<usize> {
        let dir = self.dir(identity);
        let mut removed = 0;
        for name in self.file_names(identity).await? {
            let hit = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| extensions.contains(&ext));
            if hit {
                common::delete_config_file(&dir.join(&name)).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} old {:?} artifact(s) for {}", removed, extensions, identity);
        }
        Ok(removed)
    }

    /// Remove every dated file belonging to `protocol`
    pub async fn remove_protocol(
        &self,
        identity: &ClientIdentity,
        protocol: Protocol,
    ) -> ProvisionResult<usize> {
        let dir = self.dir(identity);
        let mut removed = 0;
        for name in self.file_names(identity).await? {
            if ArtifactKind::from_file_name(&name).is_some_and(|k| k.protocol() == protocol) {
                common::delete_config_file(&dir.join(&name)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All recognized artifacts for the identity
    pub async fn list(&self, identity: &ClientIdentity) -> ProvisionResult<Vec<(ArtifactKind, PathBuf)>> {
        let dir = self.dir(identity);
        Ok(self
            .file_names(identity)
            .await?
            .into_iter()
            .filter_map(|name| ArtifactKind::from_file_name(&name).map(|k| (k, dir.join(name))))
            .collect())
    }

    /// Newest artifact of `kind`; dated names sort chronologically
    pub async fn find(&self, identity: &ClientIdentity, kind: ArtifactKind) -> ProvisionResult<Option<PathBuf>> {
        let dir = self.dir(identity);
        Ok(self
            .file_names(identity)
            .await?
            .into_iter()
            .filter(|name| kind.matches(name))
            .max()
            .map(|name| dir.join(name)))
    }

    /// Remove the identity's directory when nothing is left in it
    pub async fn remove_dir_if_empty(&self, identity: &ClientIdentity) -> ProvisionResult<bool> {
        let dir = self.dir(identity);
        if !common::path_exists(&dir).await {
            return Ok(false);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        if entries.next_entry().await?.is_some() {
            return Ok(false);
        }
        info!("Removing empty client directory: {:?}", dir);
        tokio::fs::remove_dir(&dir).await?;
        Ok(true)
    }
}
