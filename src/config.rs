use crate::core::backend::{FamilyBackend, FamilyCommands, PersistMethod};
use crate::core::error::{Error, Result};
use crate::core::property::{Family, SyntaxOptions};
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tools and persistence for one family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FamilyConfig {
    pub commands: FamilyCommands,
    pub persist: PersistMethod,
}

impl FamilyConfig {
    pub fn default_for(family: Family) -> Self {
        Self {
            commands: FamilyCommands::default_for(family),
            persist: PersistMethod::default_for(family),
        }
    }
}

fn default_ipv4() -> FamilyConfig {
    FamilyConfig::default_for(Family::Ipv4)
}

fn default_ipv6() -> FamilyConfig {
    FamilyConfig::default_for(Family::Ipv6)
}

fn default_ethernet() -> FamilyConfig {
    FamilyConfig::default_for(Family::Ethernet)
}

fn default_true() -> bool {
    true
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default = "default_ipv4")]
    pub ipv4: FamilyConfig,
    #[serde(default = "default_ipv6")]
    pub ipv6: FamilyConfig,
    #[serde(default = "default_ethernet")]
    pub ethernet: FamilyConfig,
    /// Installation-specific syntax knobs (e.g. `legacy_set_mark`)
    #[serde(flatten)]
    pub syntax: SyntaxOptions,
    /// Record mutating operations in the audit log
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ipv4: default_ipv4(),
            ipv6: default_ipv6(),
            ethernet: default_ethernet(),
            syntax: SyntaxOptions::default(),
            audit: true,
        }
    }
}

impl AppConfig {
    pub fn family(&self, family: Family) -> &FamilyConfig {
        match family {
            Family::Ipv4 => &self.ipv4,
            Family::Ipv6 => &self.ipv6,
            Family::Ethernet => &self.ethernet,
        }
    }

    pub fn backend(&self, family: Family) -> FamilyBackend {
        let config = self.family(family);
        FamilyBackend::new(family, config.commands.clone(), config.persist.clone())
    }

    /// Every program this configuration may run with privileges
    pub fn allowed_programs(&self) -> Vec<String> {
        let mut programs = vec!["install".to_string()];
        for config in [&self.ipv4, &self.ipv6, &self.ethernet] {
            programs.push(config.commands.binary.clone());
            programs.push(config.commands.save.clone());
            if let PersistMethod::Command { argv } = &config.persist
                && let Some(program) = argv.first()
            {
                programs.push(program.clone());
            }
        }
        programs.sort();
        programs.dedup();
        programs
    }
}

/// Default config location in the data directory
pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|mut path| {
        path.push("config.json");
        path
    })
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config.
///
/// With an explicit `path`, the file must exist and parse. Without one, the
/// data directory's `config.json` is used if present, else defaults.
///
/// # Errors
///
/// Returns `Err` if an explicit file cannot be read, or if any config file
/// that exists fails to parse.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let json = tokio::fs::read_to_string(path).await?;
        return Ok(serde_json::from_str(&json)?);
    }

    let Some(path) = default_config_path() else {
        return Ok(AppConfig::default());
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str(&json).map_err(|e| {
            Error::validation("config", format!("{}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(AppConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.audit);
        assert!(!config.syntax.legacy_set_mark);
        assert_eq!(config.ethernet.persist, PersistMethod::Disabled);
        assert!(config.allowed_programs().contains(&"install".to_string()));
        assert!(config.allowed_programs().contains(&"ebtables-save".to_string()));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{
            "ipv4": {
                "commands": {"binary": "iptables-legacy", "save": "iptables-legacy-save"},
                "persist": {"method": "command", "argv": ["netfilter-persistent", "save"]}
            },
            "legacy_set_mark": true
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.ipv4.commands.binary, "iptables-legacy");
        assert!(config.syntax.legacy_set_mark);
        assert_eq!(config.ipv6, FamilyConfig::default_for(Family::Ipv6));
        assert!(config.audit);
        assert!(
            config
                .allowed_programs()
                .contains(&"netfilter-persistent".to_string())
        );
        assert_eq!(config.backend(Family::Ipv4).commands.save, "iptables-legacy-save");
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.audit = false;
        save_config(&config, &path).await.unwrap();

        let loaded = load_config(Some(&path)).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_explicit_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.json"))).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
