//! Command implementations
//!
//! Each command opens the shared store through [`Context`] and calls exactly
//! one core operation.

pub mod checkpoints;
pub mod decisions;
pub mod events;
pub mod health;
pub mod locks;
pub mod monitor;
pub mod regressions;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::ArgMatches;
use convoy_core::{
    load_config, load_config_file, Coordinator, CoordinationConfig, GitRepository, HealthManager,
    Store, VersionControl,
};
use serde_json::Value;

/// Resolved configuration plus an open store.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: CoordinationConfig,
    pub store: Store,
    pub json: bool,
}

impl Context {
    /// Resolve config layers, apply `--db` and open the store.
    pub async fn open(matches: &ArgMatches) -> Result<Self> {
        let config = resolve_config(matches).await?;
        let store = Store::open(&config.database_path).await?;
        Ok(Self {
            config,
            store,
            json: matches.get_flag("json"),
        })
    }

    pub fn health(&self) -> HealthManager {
        HealthManager::new(self.store.clone(), self.config.health_thresholds())
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.store.clone(), self.health(), &self.config)
    }

    /// Repository handle for read-only listings; `git` is not consulted.
    pub fn repository(&self) -> Arc<dyn VersionControl> {
        Arc::new(GitRepository::new(self.config.repository_path.clone()))
    }

    /// Repository handle for commands that snapshot, restore or delete refs.
    pub async fn discover_repository(&self) -> Result<Arc<dyn VersionControl>> {
        let repo = GitRepository::discover(&self.config.repository_path).await?;
        Ok(Arc::new(repo))
    }

    /// Print `value` as JSON in `--json` mode, otherwise run `human`.
    pub fn emit<T: serde::Serialize + ?Sized>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

async fn resolve_config(matches: &ArgMatches) -> Result<CoordinationConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => load_config_file(path).await?,
        None => load_config().await?,
    };
    if let Some(db) = matches.get_one::<PathBuf>("db") {
        config.database_path.clone_from(db);
    }
    Ok(config)
}

/// A plain acknowledgement for commands with no richer result.
pub fn ack(message: impl Into<String>) -> Value {
    serde_json::json!({ "success": true, "message": message.into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;

    #[tokio::test]
    async fn db_flag_overrides_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("config.toml");
        tokio::fs::write(&config_path, "lock_ttl_secs = 42\n").await?;
        let db = dir.path().join("state").join("convoy.db");

        let matches = build_cli().try_get_matches_from([
            "convoy".to_string(),
            "health".to_string(),
            "--config".to_string(),
            config_path.display().to_string(),
            "--db".to_string(),
            db.display().to_string(),
            "--json".to_string(),
        ])?;
        let (_, sub) = matches
            .subcommand()
            .ok_or_else(|| anyhow::anyhow!("no subcommand"))?;

        let context = Context::open(sub).await?;
        assert_eq!(context.config.database_path, db);
        assert_eq!(context.config.lock_ttl_secs, 42);
        assert!(context.json);
        assert!(db.exists());
        Ok(())
    }
}
