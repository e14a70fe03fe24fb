//! WireGuard peer table format
//!
//! Server configs shared with the running daemon are edited in place. The
//! file is treated as a line-oriented format:
//!
//! ```text
//! table   := (line | block)*
//! block   := tag field* (blank | EOF | &tag)
//! tag     := "# Client = " NAME
//! field   := non-blank, non-tag line; one of them must be "[Peer]"
//! line    := anything outside a block ([Interface] section, blanks, comments)
//! ```
//!
//! Lines outside blocks round-trip untouched. A tag without a `[Peer]`
//! section, or with an empty name, is rejected instead of guessed at.

use regex::Regex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use crate::error::{ProvisionError, ProvisionResult};
use crate::identity::ClientIdentity;

const CLIENT_TAG: &str = "# Client =";

static IPV4_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("valid regex"));

/// Key material written into a new peer block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKeys {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
}

/// One tagged client fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlock {
    client: String,
    /// Lines after the tag, without the terminating blank
    fields: Vec<String>,
}

impl PeerBlock {
    pub fn new(identity: &ClientIdentity, keys: &PeerKeys, address: Ipv4Addr) -> Self {
        Self {
            client: identity.as_str().to_string(),
            fields: vec![
                format!("# PrivateKey = {}", keys.private_key),
                "[Peer]".to_string(),
                format!("PublicKey = {}", keys.public_key),
                format!("PresharedKey = {}", keys.preshared_key),
                format!("AllowedIPs = {}/32", address),
            ],
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.fields.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim())
        })
    }

    pub fn public_key(&self) -> Option<&str> {
        self.field("PublicKey")
    }

    /// First host address of `AllowedIPs`
    pub fn address(&self) -> Option<Ipv4Addr> {
        let allowed = self.field("AllowedIPs")?;
        IPV4_TOKEN.find(allowed)?.as_str().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Line(String),
    Peer(PeerBlock),
}

/// Parsed server configuration with addressable peer blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTable {
    segments: Vec<Segment>,
}

fn client_tag(line: &str) -> Option<&str> {
    line.trim().strip_prefix(CLIENT_TAG).map(str::trim)
}

impl PeerTable {
    pub fn parse(content: &str) -> ProvisionResult<Self> {
        let mut segments = Vec::new();
        let mut lines = content.lines().peekable();

        while let Some(line) = lines.next() {
            let Some(client) = client_tag(line) else {
                segments.push(Segment::Line(line.to_string()));
                continue;
            };
            if client.is_empty() {
                return Err(ProvisionError::Parse("peer tag without a client name".into()));
            }

            let mut fields = Vec::new();
            // Block ends at a blank line (consumed) or the next tag (kept)
            while let Some(field) = lines.next_if(|l| client_tag(l).is_none()) {
                if field.trim().is_empty() {
                    break;
                }
                fields.push(field.to_string());
            }

            if !fields.iter().any(|f| f.trim() == "[Peer]") {
                return Err(ProvisionError::Parse(format!(
                    "peer block for '{}' has no [Peer] section",
                    client
                )));
            }

            segments.push(Segment::Peer(PeerBlock {
                client: client.to_string(),
                fields,
            }));
        }

        Ok(Self { segments })
    }

    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        let last = self.segments.len().saturating_sub(1);

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Line(line) => lines.push(line.clone()),
                Segment::Peer(block) => {
                    lines.push(format!("{} {}", CLIENT_TAG, block.client));
                    lines.extend(block.fields.iter().cloned());
                    if i != last {
                        lines.push(String::new());
                    }
                }
            }
        }

        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        if lines.is_empty() {
            return String::new();
        }
        let mut content = lines.join("\n");
        content.push('\n');
        content
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerBlock> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Peer(block) => Some(block),
            Segment::Line(_) => None,
        })
    }

    pub fn peer(&self, identity: &ClientIdentity) -> Option<&PeerBlock> {
        self.peers().find(|p| p.client == identity.as_str())
    }

    pub fn contains(&self, identity: &ClientIdentity) -> bool {
        self.peer(identity).is_some()
    }

    /// Drop every block tagged with `identity`; true if any was present
    pub fn remove(&mut self, identity: &ClientIdentity) -> bool {
        let before = self.segments.len();
        self.segments.retain(|s| !matches!(s, Segment::Peer(b) if b.client == identity.as_str()));
        self.segments.len() != before
    }

    /// Append a block after the last non-blank line
    pub fn push(&mut self, block: PeerBlock) {
        while matches!(self.segments.last(), Some(Segment::Line(l)) if l.trim().is_empty()) {
            self.segments.pop();
        }
        if matches!(self.segments.last(), Some(Segment::Line(_))) {
            self.segments.push(Segment::Line(String::new()));
        }
        self.segments.push(Segment::Peer(block));
    }

    /// First three octets of the `Address` directive
    pub fn base_prefix(&self) -> Option<[u8; 3]> {
        self.segments.iter().find_map(|s| {
            let Segment::Line(line) = s else { return None };
            let (key, value) = line.split_once('=')?;
            if key.trim() != "Address" {
                return None;
            }
            let addr: Ipv4Addr = IPV4_TOKEN.find(value)?.as_str().parse().ok()?;
            let [a, b, c, _] = addr.octets();
            Some([a, b, c])
        })
    }

    /// Every IPv4 address mentioned anywhere in the file
    pub fn used_addresses(&self) -> HashSet<Ipv4Addr> {
        IPV4_TOKEN
            .find_iter(&self.render())
            .filter_map(|m| m.as_str().parse().ok())
            .collect()
    }

    /// Lowest free host address in `[2, 254]` of the base /24
    pub fn allocate_address(&self, network: &str) -> ProvisionResult<Ipv4Addr> {
        let [a, b, c] = self.base_prefix().ok_or_else(|| {
            ProvisionError::Parse(format!("no Address directive in {}.conf", network))
        })?;
        let used = self.used_addresses();

        (2..=254u8)
            .map(|host| Ipv4Addr::new(a, b, c, host))
            .find(|ip| !used.contains(ip))
            .ok_or_else(|| ProvisionError::Exhausted {
                network: network.to_string(),
            })
    }
}
