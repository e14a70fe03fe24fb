//! VLESS client profiles: a full Xray client JSON config and a share link

use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use url::Url;

use crate::config::VlessParams;
use crate::error::{ProvisionError, ProvisionResult};

pub const VLESS_FLOW: &str = "xtls-rprx-vision";

/// Non-empty lines of the routed address list; missing file means none
pub async fn read_route_ips(path: &Path) -> Vec<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Client config routing internal and listed addresses through the proxy
pub fn client_config(uuid: &str, params: &VlessParams, ip_prefix: &str, route_ips: &[String]) -> Value {
    let dns = format!("{}.29.12.1", ip_prefix);
    let mut proxied = vec!["10.30.0.0/15".to_string(), dns.clone()];
    proxied.extend(route_ips.iter().cloned());

    json!({
        "dns": { "servers": [dns] },
        "fakedns": [
            { "ipPool": "198.20.0.0/15", "poolSize": 128 },
            { "ipPool": "fc00::/64", "poolSize": 128 }
        ],
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": 10808,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true },
            "sniffing": {
                "destOverride": ["http", "tls", "quic"],
                "enabled": true,
                "routeOnly": true
            },
            "tag": "in-vless"
        }],
        "outbounds": [
            {
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": params.server_host,
                        "port": params.port,
                        "users": [{ "id": uuid, "encryption": "none", "flow": VLESS_FLOW }]
                    }]
                },
                "streamSettings": {
                    "network": "tcp",
                    "realitySettings": {
                        "fingerprint": "chrome",
                        "publicKey": params.public_key,
                        "serverName": params.server_names,
                        "shortId": params.short_id
                    },
                    "security": "reality",
                    "tcpSettings": {
                        "header": { "type": "none", "request": { "headers": {} } }
                    }
                },
                "tag": "proxy"
            },
            { "protocol": "freedom", "tag": "direct" },
            { "protocol": "blackhole", "tag": "block" }
        ],
        "routing": {
            "domainStrategy": "IPOnDemand",
            "rules": [
                { "ip": proxied, "outboundTag": "proxy", "type": "field" },
                { "domain": ["geosite:private"], "outboundTag": "direct", "type": "field" },
                { "ip": ["0.0.0.0/0"], "outboundTag": "direct", "type": "field" }
            ]
        }
    })
}

/// Pretty-print with four-space indentation
pub fn to_pretty_json(value: &Value) -> ProvisionResult<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(out).map_err(|e| ProvisionError::Parse(e.to_string()))
}

/// `vless://` share link with Reality parameters; fragment is the display name
pub fn vless_link(uuid: &str, params: &VlessParams) -> ProvisionResult<String> {
    let base = format!("vless://{}@{}:{}", uuid, params.server_host, params.port);
    let mut url = Url::parse(&base).map_err(|e| ProvisionError::Parse(format!("Invalid VLESS link {}: {}", base, e)))?;

    url.query_pairs_mut()
        .append_pair("type", "tcp")
        .append_pair("security", "reality")
        .append_pair("flow", VLESS_FLOW)
        .append_pair("fp", "chrome")
        .append_pair("pbk", &params.public_key)
        .append_pair("sni", &params.server_names)
        .append_pair("sid", &params.short_id);
    url.set_fragment(Some(&params.link_name));

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> VlessParams {
        VlessParams {
            server_host: "203.0.113.7".into(),
            public_key: "pbk123".into(),
            server_names: "www.example.com".into(),
            short_id: "abcd".into(),
            port: 443,
            link_name: "VPN - Global".into(),
        }
    }

    #[test]
    fn test_link_format() {
        let link = vless_link("11111111-2222-3333-4444-555555555555", &params()).unwrap();
        assert_eq!(
            link,
            "vless://11111111-2222-3333-4444-555555555555@203.0.113.7:443\
             ?type=tcp&security=reality&flow=xtls-rprx-vision&fp=chrome&pbk=pbk123&sni=www.example.com&sid=abcd\
             #VPN%20-%20Global"
        );
    }

    #[test]
    fn test_client_config_routes() {
        let routes = vec!["1.2.3.0/24".to_string()];
        let config = client_config("uuid-1", &params(), "172", &routes);

        assert_eq!(config["dns"]["servers"][0], "172.29.12.1");
        assert_eq!(config["outbounds"][0]["settings"]["vnext"][0]["users"][0]["id"], "uuid-1");
        assert_eq!(config["outbounds"][0]["settings"]["vnext"][0]["port"], 443);
        assert_eq!(
            config["routing"]["rules"][0]["ip"],
            json!(["10.30.0.0/15", "172.29.12.1", "1.2.3.0/24"])
        );
        assert_eq!(config["routing"]["rules"][2]["ip"], json!(["0.0.0.0/0"]));

        let text = to_pretty_json(&config).unwrap();
        assert!(text.contains("\n    \"dns\": {"));
    }

    #[tokio::test]
    async fn test_route_ips_missing_file() {
        assert!(read_route_ips(Path::new("/nonexistent/route-ips.txt")).await.is_empty());
    }
}
