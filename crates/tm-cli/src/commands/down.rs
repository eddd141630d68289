//! Down command implementation

use anyhow::{Context, Result};
use tm_core::OpContext;

use crate::cli::{DownArgs, GlobalArgs};
use crate::commands::common::{open_manager, print_report};

/// Execute the down command
pub(crate) async fn execute(args: &DownArgs, global: &GlobalArgs, ctx: &OpContext) -> Result<()> {
    let (_, mut manager) = open_manager(global, ctx).await?;

    let report = if args.all {
        manager.rollback_all(ctx).await
    } else {
        manager.rollback(ctx).await
    }
    .context("Failed to revert migrations")?;
    print_report(&report);

    manager.close()?;
    Ok(())
}
