//! Force command implementation

use anyhow::{Context, Result};
use tm_core::OpContext;

use crate::cli::{ForceArgs, GlobalArgs};
use crate::commands::common::open_manager;

/// Execute the force command
pub(crate) async fn execute(args: &ForceArgs, global: &GlobalArgs, ctx: &OpContext) -> Result<()> {
    let (_, mut manager) = open_manager(global, ctx).await?;
    manager
        .force_version(ctx, args.version)
        .await
        .with_context(|| format!("Failed to force version {}", args.version))?;
    println!("Forced version {} (dirty: false)", args.version);

    manager.close()?;
    Ok(())
}
