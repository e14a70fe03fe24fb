//! Common helpers shared across all protocol managers

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{ProvisionError, ProvisionResult};

/// Variables substituted into `${NAME}` template tokens
pub type TemplateVars = HashMap<String, String>;

static TEMPLATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-zA-Z_][a-zA-Z_0-9]*)\}").expect("valid regex"));

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Replace `${NAME}` tokens from `vars`; tokens without a value render as empty
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    TEMPLATE_TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Raw setup keys as the base variable layer; callers insert their own
/// protocol variables on top, which take precedence
pub fn template_vars(config: &ServerConfig) -> TemplateVars {
    config
        .values()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Render a template file from disk
pub async fn render_template_file(path: &Path, vars: &TemplateVars) -> ProvisionResult<String> {
    let template = read_config_file(path).await?;
    Ok(render_template(&template, vars))
}

/// First PEM certificate body in `content`, markers included
pub fn extract_pem_certificate(content: &str) -> Option<&str> {
    let start = content.find(PEM_BEGIN)?;
    let end = content[start..].find(PEM_END)? + start + PEM_END.len();
    Some(&content[start..end])
}

/// Parse key=value configuration format (server key files)
pub fn parse_key_value_config(content: &str) -> HashMap<String, String> {
    let mut config = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            config.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    config
}

pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> ProvisionResult<()> {
    if !path_exists(path).await {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            ProvisionError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create directory {:?}: {}", path, e),
            ))
        })?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write configuration to a file with explicit permissions
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> ProvisionResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, content).await.map_err(|e| {
        ProvisionError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to write {:?}: {}", path, e),
        ))
    })?;

    let perms = std::fs::Permissions::from_mode(permissions);
    tokio::fs::set_permissions(path, perms).await?;

    debug!("Wrote {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Read a configuration file
pub async fn read_config_file(path: &Path) -> ProvisionResult<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ProvisionError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read {:?}: {}", path, e),
        ))
    })
}

/// Delete a file if it exists
pub async fn delete_config_file(path: &Path) -> ProvisionResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Deleted file: {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete a directory tree if it exists
pub async fn delete_directory(path: &Path) -> ProvisionResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("Deleted directory: {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Copy `src` to `dest`, optionally forcing permissions on the copy
pub async fn copy_file(src: &Path, dest: &Path, permissions: Option<u32>) -> ProvisionResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::copy(src, dest).await.map_err(|e| {
        ProvisionError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to copy {:?} to {:?}: {}", src, dest, e),
        ))
    })?;

    if let Some(mode) = permissions {
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}
