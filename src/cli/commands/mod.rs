//! CLI command implementations.

pub mod event;
pub mod init;
pub mod listener;
pub mod task;
pub mod worker;

use anyhow::Result;

use crate::application::Conduit;
use crate::domain::models::Config;

/// Open the runtime for a command that needs storage.
pub(crate) async fn open_runtime(config: &Config) -> Result<Conduit> {
    Conduit::open(config.clone()).await
}
