// src/infra/paths.rs — Where sciloop keeps its config, checkpoint and database
//
// SCILOOP_HOME, when set, holds everything: config.toml, state/ and data/.
// Otherwise config and state live in ~/.sciloop/ and the objective store
// in the platform data dir (XDG_DATA_HOME/sciloop on Linux).

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;
use std::sync::OnceLock;

static PROJECT_DIRS: OnceLock<Option<ProjectDirs>> = OnceLock::new();

fn project_dirs() -> Option<&'static ProjectDirs> {
    PROJECT_DIRS
        .get_or_init(|| ProjectDirs::from("", "", "sciloop"))
        .as_ref()
}

fn home_override() -> Option<PathBuf> {
    std::env::var_os("SCILOOP_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// $SCILOOP_HOME, else ~/.sciloop. Without a resolvable home directory
/// this degrades to ./.sciloop.
pub fn config_dir() -> PathBuf {
    home_override().unwrap_or_else(|| {
        BaseDirs::new()
            .map(|b| b.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sciloop")
    })
}

pub fn data_dir() -> PathBuf {
    if let Some(home) = home_override() {
        return home.join("data");
    }
    project_dirs()
        .map(|d| d.data_local_dir().to_path_buf())
        .unwrap_or_else(|| config_dir().join("data"))
}

pub fn state_dir() -> PathBuf {
    config_dir().join("state")
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// SQLite objective store.
pub fn db_path() -> PathBuf {
    data_dir().join("sciloop.db")
}

/// Last committed CycleState; run history sits beside it.
pub fn checkpoint_path() -> PathBuf {
    state_dir().join("cycle-state.json")
}

pub async fn ensure_dirs() -> anyhow::Result<()> {
    for dir in [config_dir(), state_dir(), data_dir()] {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}
