//! Implementation of the `conduit init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::adapters::sqlite::{database_url, initialize_database, PoolConfig};
use crate::cli::display::{action_success, output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::CONFIG_DIR;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config.yaml (the database is kept)
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub initialized_path: PathBuf,
    pub config_written: bool,
    pub database_path: PathBuf,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![if self.success {
            action_success(&self.message)
        } else {
            self.message.clone()
        }];
        if self.config_written {
            lines.push(format!("  Config:   {}/config.yaml", CONFIG_DIR));
        }
        if self.success {
            lines.push(format!("  Database: {}", self.database_path.display()));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let target_path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&args.path)
    };
    let result = initialize(&target_path, args.force).await?;
    output(&result, json_mode);
    Ok(())
}

/// Create `<target>/.conduit` with a default config and a migrated database.
pub async fn initialize(target_path: &Path, force: bool) -> Result<InitOutput> {
    let config_dir = target_path.join(CONFIG_DIR);
    let config_path = config_dir.join("config.yaml");
    let defaults = Config::default();
    let database_path = target_path.join(&defaults.database.path);

    if config_path.exists() && !force {
        return Ok(InitOutput {
            success: false,
            message: "Project already initialized. Use --force to rewrite config.yaml.".to_string(),
            initialized_path: target_path.to_path_buf(),
            config_written: false,
            database_path,
        });
    }

    fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let yaml = serde_yaml::to_string(&defaults).context("Failed to serialize default config")?;
    fs::write(&config_path, yaml)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    let url = database_url(&database_path.to_string_lossy());
    let pool = initialize_database(&url, Some(PoolConfig::from(&defaults.database)))
        .await
        .context("Failed to initialize database")?;
    pool.close().await;

    Ok(InitOutput {
        success: true,
        message: if force {
            "Project reinitialized successfully.".to_string()
        } else {
            "Project initialized successfully.".to_string()
        },
        initialized_path: target_path.to_path_buf(),
        config_written: true,
        database_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::ConfigLoader;

    #[tokio::test]
    async fn test_initialize_writes_loadable_config_and_database() {
        let dir = tempfile::tempdir().unwrap();

        let result = initialize(dir.path(), false).await.unwrap();
        assert!(result.success);
        assert!(result.database_path.exists());

        let config = ConfigLoader::load_from_file(dir.path().join(CONFIG_DIR).join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn test_second_initialize_without_force_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        initialize(dir.path(), false).await.unwrap();

        let again = initialize(dir.path(), false).await.unwrap();
        assert!(!again.success);

        let forced = initialize(dir.path(), true).await.unwrap();
        assert!(forced.success);
    }
}
