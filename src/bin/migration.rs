use clap::{Parser, Subcommand};
use remitflow::config::{init_tracing, load_config};
use remitflow::db::establish_connection_from_app_config;
use remitflow::migrator::Migrator;
use sea_orm_migration::MigratorTrait;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "migration", about = "Manage the remitflow database schema")]
struct Cli {
    /// Overrides the configured database URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations.
    Up,
    /// Roll back every applied migration.
    Down,
    /// Print applied and pending migrations.
    Status,
    /// Drop all tables and re-apply every migration.
    Fresh,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = load_config()?;
    init_tracing(&cfg.log_level, cfg.log_json);
    if let Some(url) = cli.database_url {
        cfg.database_url = url;
    }
    // The subcommand decides what runs.
    cfg.auto_migrate = false;

    let db = establish_connection_from_app_config(&cfg).await?;
    let result = match cli.command {
        Command::Up => Migrator::up(&db, None).await,
        Command::Down => Migrator::down(&db, None).await,
        Command::Status => Migrator::status(&db).await,
        Command::Fresh => Migrator::fresh(&db).await,
    };

    match result {
        Ok(()) => {
            info!("migration command finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "migration command failed");
            Err(e.into())
        }
    }
}
