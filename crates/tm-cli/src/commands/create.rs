//! Create command implementation

use anyhow::{Context, Result};
use tm_core::VersionFormat;
use tm_migrate::source::{self, CreateOptions};

use crate::cli::{CreateArgs, GlobalArgs};
use crate::commands::common::load_project;

/// Execute the create command. Touches only the migrations directory.
pub(crate) async fn execute(args: &CreateArgs, global: &GlobalArgs) -> Result<()> {
    let project = load_project(global)?;
    let migrations = &project.config.migrations;
    let dir = migrations.path_absolute(&project.root);

    let options = CreateOptions {
        format: if args.seq {
            VersionFormat::Sequence
        } else {
            migrations.version_format
        },
        sequence_digits: migrations.sequence_digits,
    };
    let created = source::create(&dir, &args.name, &options)
        .with_context(|| format!("Failed to create migration '{}'", args.name))?;

    println!("Created migration {}", created.version);
    println!("  {}", created.up_path.display());
    println!("  {}", created.down_path.display());
    Ok(())
}
