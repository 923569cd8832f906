mod cli;

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use serde::Serialize;
use tgm_core::{
    config::Config,
    domain::SessionId,
    maintenance::MaintenanceTask,
    recovery::SessionRecoveryManager,
    session::SummaryFormat,
    storage::FileSessionStorage,
};

use cli::{Cli, Commands, SelectArgs};

type Manager = SessionRecoveryManager<FileSessionStorage>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("tgm: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tgm_core::logging::init("tgm")?;

    let cfg = Config::load()?;
    let storage = FileSessionStorage::from_config(&cfg)?;
    let manager = SessionRecoveryManager::new(storage);

    match cli.command {
        Commands::List(args) => {
            let sessions = manager
                .storage()
                .list_sessions(args.session_type.as_deref(), args.status)?;
            print_json(&sessions)
        }
        Commands::Interrupted(args) => {
            let max_age = args.max_age_hours.unwrap_or(cfg.interrupted_max_age_hours);
            let types = if args.session_types.is_empty() {
                cfg.session_type_filter()
            } else {
                Some(args.session_types.as_slice())
            };
            let ids = manager.find_interrupted_sessions(max_age, types)?;
            print_json(&ids)
        }
        Commands::Analyze(args) => {
            let session = manager.load(&SessionId::from(args.id))?;
            print_json(&manager.analyze_session(&session))
        }
        Commands::Recover(args) => {
            let ids = select_ids(&manager, &cfg, &args)?;
            let results = manager.recover_sessions(&ids);
            print_json(&results)?;

            let failed = results.values().filter(|ok| !**ok).count();
            if failed > 0 {
                bail!("{failed} of {} sessions could not be recovered", results.len());
            }
            Ok(())
        }
        Commands::Report(args) => {
            let ids = select_ids(&manager, &cfg, &args)?;
            print_json(&manager.generate_recovery_report(&ids))
        }
        Commands::Checkpoint(args) => {
            let mut session = manager.load(&SessionId::from(args.id))?;
            manager.create_checkpoint(&mut session, &args.name)?;
            println!("Created checkpoint {} for session {}", args.name, session.id());
            Ok(())
        }
        Commands::Show(args) => {
            let id = SessionId::from(args.id);
            if args.text {
                let session = manager.load(&id)?;
                if let Some(text) = session.export_summary(SummaryFormat::Text).as_str() {
                    println!("{text}");
                }
                return Ok(());
            }
            let report = manager
                .storage()
                .session_report(&id)?
                .ok_or_else(|| anyhow!("session {id} not found"))?;
            print_json(&report)
        }
        Commands::Archive(args) => {
            let days = args.older_than_days.unwrap_or(cfg.archive_age_days);
            let format = args.format.unwrap_or(cfg.archive_format);
            let archived = manager.storage().archive_completed_sessions(
                days,
                Some(&cfg.archive_dir),
                format,
            )?;
            println!(
                "Archived {archived} sessions to {}",
                cfg.archive_dir.display()
            );
            Ok(())
        }
        Commands::Maintain => {
            let handle = MaintenanceTask::spawn(Arc::new(manager.storage().clone()), &cfg);
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            handle.stop().await;
            Ok(())
        }
    }
}

fn select_ids(manager: &Manager, cfg: &Config, args: &SelectArgs) -> anyhow::Result<Vec<SessionId>> {
    if !args.all_interrupted {
        return Ok(args.ids.iter().map(|id| SessionId::from(id.as_str())).collect());
    }
    let max_age = args.max_age_hours.unwrap_or(cfg.interrupted_max_age_hours);
    Ok(manager.find_interrupted_sessions(max_age, cfg.session_type_filter())?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
