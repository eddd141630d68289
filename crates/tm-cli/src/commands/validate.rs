//! Validate command implementation

use anyhow::{Context, Result};
use tm_core::OpContext;

use crate::cli::GlobalArgs;
use crate::commands::common::open_manager;

/// Execute the validate command
pub(crate) async fn execute(global: &GlobalArgs, ctx: &OpContext) -> Result<()> {
    let (_, mut manager) = open_manager(global, ctx).await?;
    manager
        .validate_migrations(ctx)
        .await
        .context("Migration validation failed")?;

    let count = manager.migrations()?.len();
    println!(
        "{} migration{} valid",
        count,
        if count == 1 { "" } else { "s" }
    );

    manager.close()?;
    Ok(())
}
