//! Kernel configuration.
//!
//! Loaded by the embedding binary from `~/.kiwi/config.toml` (TOML, every
//! field optional) with environment overrides for the scope paths. The
//! defaults are usable with no file present.

use std::path::{Path, PathBuf};

use kiwi_primitives::EnvSanitizer;
use kiwi_telemetry::TelemetryStore;
use kiwi_tools::ToolRoots;
use kiwi_types::PricingTable;
use serde::Deserialize;
use tracing::warn;

use crate::executor::{ExecutorOptions, UniversalExecutor};

/// Overrides the user scope directory (default `~/.kiwi`).
pub const USER_DIR_ENV: &str = "KIWI_USER_DIR";
/// Overrides the project scope directory (default `./.kiwi` when present).
pub const PROJECT_DIR_ENV: &str = "KIWI_PROJECT_DIR";

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    project_dir: Option<PathBuf>,
    #[serde(default)]
    user_dir: Option<PathBuf>,
    #[serde(default)]
    telemetry: Option<bool>,
    #[serde(default)]
    allow_lockfile_refresh: Option<bool>,
    #[serde(default)]
    pricing_table: Option<PathBuf>,
    #[serde(default)]
    env_denylist: Option<Vec<String>>,
}

/// Resolved kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub project_dir: Option<PathBuf>,
    pub user_dir: PathBuf,
    /// Telemetry is opt-in.
    pub telemetry_enabled: bool,
    pub allow_lockfile_refresh: bool,
    pub pricing_table_path: Option<PathBuf>,
    pub env_denylist: Vec<String>,
}

impl KernelConfig {
    /// Load from `<user_dir>/config.toml`, applying env overrides for the
    /// scope paths. Malformed files fall back to defaults with a warning.
    #[must_use]
    pub fn load(working_dir: &Path) -> Self {
        let user_dir = std::env::var_os(USER_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".kiwi")))
            .unwrap_or_else(|| PathBuf::from(".kiwi"));

        let file = read_config_file(&user_dir.join("config.toml"));

        let project_dir = std::env::var_os(PROJECT_DIR_ENV)
            .map(PathBuf::from)
            .or(file.project_dir)
            .or_else(|| {
                let default = working_dir.join(".kiwi");
                default.is_dir().then_some(default)
            });

        Self {
            project_dir,
            user_dir: file.user_dir.unwrap_or(user_dir),
            telemetry_enabled: file.telemetry.unwrap_or(false),
            allow_lockfile_refresh: file.allow_lockfile_refresh.unwrap_or(true),
            pricing_table_path: file.pricing_table,
            env_denylist: file.env_denylist.unwrap_or_else(|| {
                EnvSanitizer::DEFAULT_DENYLIST
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }),
        }
    }

    #[must_use]
    pub fn roots(&self) -> ToolRoots {
        ToolRoots::new(self.project_dir.clone(), self.user_dir.clone())
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetryStore {
        TelemetryStore::at_user_scope(&self.user_dir, self.telemetry_enabled)
    }

    /// The pricing table: the configured override file, else the built-in.
    #[must_use]
    pub fn pricing(&self) -> PricingTable {
        let Some(path) = &self.pricing_table_path else {
            return PricingTable::builtin();
        };
        match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %path.display(), "failed to load pricing table, using built-in: {e}");
                PricingTable::builtin()
            }
        }
    }

    /// Assemble a configured executor.
    #[must_use]
    pub fn build_executor(&self) -> UniversalExecutor {
        let sanitizer = EnvSanitizer::new(&self.env_denylist).unwrap_or_else(|e| {
            warn!("invalid env_denylist, using defaults: {e}");
            EnvSanitizer::default_denylist()
        });
        UniversalExecutor::new(
            self.roots(),
            self.telemetry(),
            ExecutorOptions {
                allow_lockfile_refresh: self.allow_lockfile_refresh,
            },
        )
        .with_sanitizer(sanitizer)
    }
}

fn read_config_file(path: &Path) -> ConfigFile {
    if !path.is_file() {
        return ConfigFile::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str(&text) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "malformed config, using defaults: {e}");
                ConfigFile::default()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), "unreadable config, using defaults: {e}");
            ConfigFile::default()
        }
    }
}
