//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tm_core::{Config, CoreError, OpContext};
use tm_db::{Database, DuckDbBackend};
use tm_migrate::lock::open_contended;
use tm_migrate::{MigrationManager, MigrationReport, MigratorSettings};

use crate::cli::GlobalArgs;

/// A loaded configuration together with the directory its paths resolve against
#[derive(Debug)]
pub(crate) struct Project {
    pub(crate) root: PathBuf,
    pub(crate) config: Config,
}

/// Load the project config and apply command-line overrides.
///
/// A project directory without `tidemark.yml` runs on defaults, so `tm` works
/// against a bare migrations folder.
pub(crate) fn load_project(global: &GlobalArgs) -> Result<Project> {
    let root = PathBuf::from(&global.project_dir);
    let mut config = match &global.config {
        Some(path) => Config::load(Path::new(path)).context("Failed to load config")?,
        None => match Config::load_from_dir(&root) {
            Ok(config) => config,
            Err(CoreError::ConfigNotFound { path }) => {
                log::debug!("No config at {path}, using defaults");
                Config::default()
            }
            Err(e) => return Err(e).context("Failed to load config"),
        },
    };

    if let Some(database) = &global.database {
        config.database.path = database.clone();
    }
    if let Some(path) = &global.migrations_path {
        config.migrations.path = path.clone();
    }
    if let Some(secs) = global.timeout {
        config.migrations.timeout_secs = secs;
    }
    config.validate().context("Invalid configuration")?;

    Ok(Project { root, config })
}

/// Database path from config, relative paths resolved against the project root
pub(crate) fn database_path(project: &Project) -> String {
    let path = &project.config.database.path;
    if path == ":memory:" || Path::new(path).is_absolute() {
        return path.clone();
    }
    project.root.join(path).display().to_string()
}

/// Open the project database.
///
/// DuckDB admits one writing process per file, so an open that finds the
/// file held waits with the lock backoff, bounded by `lock.timeout_secs`.
pub(crate) async fn create_database_connection(
    project: &Project,
    ctx: &OpContext,
) -> Result<Arc<dyn Database>> {
    let path = database_path(project);
    let backend = open_contended(ctx, &path, project.config.lock.timeout(), || {
        DuckDbBackend::new(&path)
    })
    .await
    .context("Failed to connect to database")?;
    log::debug!("Connected to {path}");
    Ok(Arc::new(backend))
}

/// Open the database and build a migration manager without touching the
/// state table or the migration source
pub(crate) async fn connect_manager(
    global: &GlobalArgs,
    ctx: &OpContext,
) -> Result<(Project, MigrationManager)> {
    let project = load_project(global)?;
    let db = create_database_connection(&project, ctx).await?;
    let settings = MigratorSettings::from_config(&project.config, &project.root);
    Ok((project, MigrationManager::new(db, settings)))
}

/// Open the database and return an initialized migration manager
pub(crate) async fn open_manager(
    global: &GlobalArgs,
    ctx: &OpContext,
) -> Result<(Project, MigrationManager)> {
    let (project, mut manager) = connect_manager(global, ctx).await?;
    manager
        .init(ctx)
        .await
        .context("Failed to initialize migrations")?;
    Ok((project, manager))
}

/// Print the steps of a migration run and its end state
pub(crate) fn print_report(report: &MigrationReport) {
    if report.is_noop() {
        println!("No change (version {})", report.to);
        return;
    }
    for step in &report.steps {
        println!(
            "  {:>5} {} {} ({}ms)",
            step.direction.to_string(),
            step.version,
            step.name,
            step.elapsed.as_millis()
        );
    }
    println!(
        "Version {} -> {} ({} step{}, {:.2}s)",
        report.from,
        report.to,
        report.steps.len(),
        if report.steps.len() == 1 { "" } else { "s" },
        report.elapsed.as_secs_f64()
    );
}

#[cfg(test)]
#[path = "common_test.rs"]
mod tests;
