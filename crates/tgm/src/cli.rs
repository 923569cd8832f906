use clap::{Args, Parser, Subcommand};
use tgm_core::{archive::ArchiveFormat, domain::SessionStatus};

#[derive(Parser)]
#[command(name = "tgm")]
#[command(about = "Session inspection and crash recovery for the Telegram member manager")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List stored sessions, most recently updated first
    #[command(alias = "ls")]
    List(ListArgs),
    /// Show sessions that stopped without completing
    Interrupted(InterruptedArgs),
    /// Print the recoverability analysis of a session
    Analyze(SessionArg),
    /// Recover sessions and save them
    Recover(SelectArgs),
    /// Print a recovery report without changing anything
    Report(SelectArgs),
    /// Snapshot the current state of a session as a named checkpoint
    Checkpoint(CheckpointArgs),
    /// Show a session report
    Show(ShowArgs),
    /// Archive completed and failed sessions
    Archive(ArchiveArgs),
    /// Run periodic archiving until interrupted (Ctrl-C)
    Maintain,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only sessions of this type
    #[arg(long = "type", short = 't')]
    pub session_type: Option<String>,

    /// Only sessions with this status
    #[arg(long, short = 's', value_parser = parse_status)]
    pub status: Option<SessionStatus>,
}

#[derive(Args, Debug)]
pub struct InterruptedArgs {
    /// Ignore sessions last updated longer ago than this (defaults to TGM_INTERRUPTED_MAX_AGE_HOURS)
    #[arg(long)]
    pub max_age_hours: Option<u32>,

    /// Restrict to these session types (repeatable)
    #[arg(long = "type", short = 't')]
    pub session_types: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SessionArg {
    /// Session ID
    pub id: String,
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Session IDs
    #[arg(required_unless_present = "all_interrupted", conflicts_with = "all_interrupted")]
    pub ids: Vec<String>,

    /// Select every interrupted session instead of explicit IDs
    #[arg(long)]
    pub all_interrupted: bool,

    /// Age window used with --all-interrupted
    #[arg(long, requires = "all_interrupted")]
    pub max_age_hours: Option<u32>,
}

#[derive(Args, Debug)]
pub struct CheckpointArgs {
    /// Session ID
    pub id: String,

    /// Checkpoint name
    pub name: String,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Session ID
    pub id: String,

    /// Print the short text summary instead of the JSON report
    #[arg(long)]
    pub text: bool,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Archive sessions last updated before midnight this many days ago
    #[arg(long)]
    pub older_than_days: Option<u32>,

    /// zip, tar.gz or none
    #[arg(long)]
    pub format: Option<ArchiveFormat>,
}

fn parse_status(raw: &str) -> Result<SessionStatus, String> {
    let status = SessionStatus::parse_lenient(raw);
    if status.as_str() == raw.trim().to_lowercase() {
        Ok(status)
    } else {
        Err(format!("unknown session status: {raw}"))
    }
}
