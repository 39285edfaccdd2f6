//! Operator CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tabled::{Table, Tabled};
use thinclone_fs::FsManager;
use thinclone_fs::snapshot::format_dsa;
use thinclone_pool::{BackendFactory, PoolRegistry, StatfsProbe};

use crate::config::AppConfig;

/// thinclone - thin database clones on copy-on-write pools
#[derive(Parser)]
#[command(name = "thinclone")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to server.yml
    #[arg(short, long, global = true, env = "THINCLONE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the pool mount directory
    #[arg(long, global = true)]
    pub mount_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// thinclone commands.
#[derive(Subcommand)]
pub enum Commands {
    /// List discovered pools, Active pool first
    Pools,

    /// List snapshots
    Snapshots {
        /// Only this pool
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// List branches of a pool
    Branches {
        /// Pool name
        #[arg(short, long)]
        pool: String,
    },

    /// Show the pool the next full refresh would load
    RefreshCandidate,

    /// Validate the configuration file
    CheckConfig,
}

#[derive(Tabled)]
struct PoolRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "MODE")]
    mode: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DATA STATE AT")]
    data_state_at: String,
    #[tabled(rename = "CLONES")]
    clones: String,
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "POOL")]
    pool: String,
    #[tabled(rename = "CREATED")]
    created_at: String,
    #[tabled(rename = "DATA STATE AT")]
    data_state_at: String,
    #[tabled(rename = "CLONES")]
    clones: usize,
}

#[derive(Tabled)]
struct BranchRow {
    #[tabled(rename = "BRANCH")]
    name: String,
    #[tabled(rename = "SNAPSHOT")]
    snapshot_id: String,
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

impl Cli {
    /// Resolve and load the configuration.
    ///
    /// An explicit path must exist; without one the default file is used if
    /// present, otherwise built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or is invalid.
    pub fn load_config(&self) -> Result<(AppConfig, Option<PathBuf>)> {
        let path = match &self.config {
            Some(path) => Some(path.clone()),
            None => Some(AppConfig::default_path()).filter(|p| p.exists()),
        };

        let mut config = match &path {
            Some(path) => AppConfig::load(path)?,
            None => {
                tracing::debug!("No configuration file, using defaults");
                AppConfig::default()
            }
        };
        if let Some(mount_dir) = &self.mount_dir {
            config.pool_manager.mount_dir.clone_from(mount_dir);
        }
        config.validate()?;
        Ok((config, path))
    }

    async fn registry(config: &AppConfig) -> Result<Arc<PoolRegistry>> {
        let pools = &config.pool_manager;
        let registry = Arc::new(PoolRegistry::new(
            pools.clone(),
            Arc::new(StatfsProbe::new()),
            Arc::new(BackendFactory::host(pools.manager_config(), pools.use_sudo)),
        ));
        registry.discover().await?;
        Ok(registry)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let (config, path) = self.load_config()?;

        match self.command {
            Commands::CheckConfig => {
                match path {
                    Some(path) => println!("Configuration OK: {}", path.display()),
                    None => println!("Configuration OK: built-in defaults"),
                }
                Ok(())
            }

            Commands::Pools => {
                let registry = Self::registry(&config).await?;
                let mut rows = Vec::new();
                for fsm in registry.get_fs_manager_ordered_list() {
                    let pool = fsm.pool();
                    let clones = match fsm.list_clones_names().await {
                        Ok(names) => names.len().to_string(),
                        Err(e) => {
                            tracing::warn!(pool = %pool.name, error = %e, "Failed to list clones");
                            "?".to_string()
                        }
                    };
                    rows.push(PoolRow {
                        name: pool.name.clone(),
                        mode: pool.mode.to_string(),
                        status: pool.status().to_string(),
                        data_state_at: or_dash(pool.data_state_at().map(format_dsa)),
                        clones,
                    });
                }
                println!("{}", Table::new(rows));
                Ok(())
            }

            Commands::Snapshots { pool } => {
                let registry = Self::registry(&config).await?;
                let managers: Vec<Arc<dyn FsManager>> = match &pool {
                    Some(name) => vec![registry.get_fs_manager(name)?],
                    None => registry.get_fs_manager_list(),
                };

                let mut rows = Vec::new();
                for fsm in managers {
                    fsm.refresh_snapshot_list().await?;
                    rows.extend(fsm.snapshot_list().into_iter().map(|s| SnapshotRow {
                        id: s.id,
                        pool: s.pool,
                        created_at: format_dsa(s.created_at),
                        data_state_at: or_dash(s.data_state_at.map(format_dsa)),
                        clones: s.num_clones,
                    }));
                }
                println!("{}", Table::new(rows));
                Ok(())
            }

            Commands::Branches { pool } => {
                let registry = Self::registry(&config).await?;
                let fsm = registry.get_fs_manager(&pool)?;
                let rows: Vec<BranchRow> = fsm
                    .list_all_branches()
                    .await?
                    .into_iter()
                    .map(|b| BranchRow {
                        name: b.name,
                        snapshot_id: b.snapshot_id,
                    })
                    .collect();
                println!("{}", Table::new(rows));
                Ok(())
            }

            Commands::RefreshCandidate => {
                let registry = Self::registry(&config).await?;
                match registry.get_pool_to_update().await {
                    Ok(fsm) => {
                        println!("{}", fsm.pool().name);
                        Ok(())
                    }
                    Err(e) if e.is_capacity() => {
                        println!("No pool can be refreshed now: every idle pool has clones");
                        Ok(())
                    }
                    Err(e) => Err(eyre!(e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mount_dir_override_applies() {
        let cli = Cli::parse_from([
            "thinclone",
            "--config",
            "/nonexistent/server.yml",
            "check-config",
        ]);
        assert!(cli.load_config().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yml");
        std::fs::write(&path, "poolManager:\n  mountDir: /srv/pools\n").unwrap();
        let cli = Cli::parse_from([
            "thinclone",
            "--config",
            path.to_str().unwrap(),
            "--mount-dir",
            "/mnt/pools",
            "pools",
        ]);
        let (config, loaded) = cli.load_config().unwrap();
        assert_eq!(config.pool_manager.mount_dir, PathBuf::from("/mnt/pools"));
        assert_eq!(loaded, Some(path));
    }
}
