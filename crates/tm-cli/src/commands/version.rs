//! Version command implementation

use anyhow::{Context, Result};
use tm_core::OpContext;

use crate::cli::GlobalArgs;
use crate::commands::common::connect_manager;

/// Execute the version command.
///
/// Reads the state row only; the migration files are never loaded.
pub(crate) async fn execute(global: &GlobalArgs, ctx: &OpContext) -> Result<()> {
    let (_, mut manager) = connect_manager(global, ctx).await?;
    let state = manager
        .get_version()
        .await
        .context("Failed to read schema version")?;

    // consumed by scripts; keep the two lines exactly
    println!("version: {}", state.version);
    println!("dirty: {}", state.dirty);

    manager.close()?;
    Ok(())
}
