//! Up command implementation

use anyhow::{Context, Result};
use tm_core::OpContext;

use crate::cli::{GlobalArgs, UpArgs};
use crate::commands::common::{open_manager, print_report};

/// Execute the up command
pub(crate) async fn execute(args: &UpArgs, global: &GlobalArgs, ctx: &OpContext) -> Result<()> {
    let (project, mut manager) = open_manager(global, ctx).await?;
    let steps = args.steps.unwrap_or(project.config.migrations.steps);

    let report = manager
        .run_migrations(ctx, steps)
        .await
        .context("Failed to apply migrations")?;
    print_report(&report);

    manager.close()?;
    Ok(())
}
