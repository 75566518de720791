//! caseguard Operator Tool
//!
//! Connection and keyspace come from the environment (`DATABASE_URL`,
//! `CASEGUARD_DB_*`, `CASEGUARD_LOCK_*`). Exit code 0 on success, 1 on error,
//! 2 on bad usage.

use caseguard_core::{AgentRun, CaseGuardConfig, CaseGuardResult, CaseId};
use caseguard_pg::{init_tracing, migrate, DbConfig, DbPools, PgRunStore, TelemetryConfig};
use caseguard_storage::RunStore;
use clap::{Parser, Subcommand};
use std::process::ExitCode;

const DEFAULT_RUNS_LIMIT: usize = 20;

/// Inspect and repair case locks and run records.
#[derive(Parser, Debug)]
#[command(name = "caseguard-admin", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Create the agent_runs table and its indexes if they do not exist.
    Migrate,

    /// Report whether a case lock is held right now.
    ///
    /// The answer is a point-in-time hint and may be stale by the time it
    /// is printed.
    IsLocked {
        /// Case to probe
        case_id: CaseId,
    },

    /// Free a stuck case lock by terminating the session holding it.
    ///
    /// Only use this when the holder is known to be dead; a slow but live
    /// run loses its lock too.
    ForceUnlock {
        /// Case to unlock
        case_id: CaseId,
    },

    /// Print the most recent runs for a case as JSON lines, newest first.
    Runs {
        /// Case to list
        case_id: CaseId,
        /// Maximum number of runs
        #[arg(default_value_t = DEFAULT_RUNS_LIMIT)]
        limit: usize,
    },

    /// Print runs still pending or running as JSON lines, oldest first.
    ///
    /// Runs whose caller went away stay open for good and show up here.
    OpenRuns {
        /// Maximum number of runs
        #[arg(default_value_t = DEFAULT_RUNS_LIMIT)]
        limit: usize,
    },
}

async fn run(command: Command) -> CaseGuardResult<()> {
    let pools = DbPools::from_config(&DbConfig::from_env()?)?;

    match command {
        Command::Migrate => {
            migrate(&pools.runs).await?;
            println!("agent_runs schema ready");
        }
        Command::IsLocked { case_id } => {
            let orch = caseguard_pg::orchestrator(&pools, CaseGuardConfig::from_env()?)?;
            let locked = orch.is_locked(case_id).await?;
            println!("case {} {}", case_id, if locked { "locked" } else { "free" });
        }
        Command::ForceUnlock { case_id } => {
            let orch = caseguard_pg::orchestrator(&pools, CaseGuardConfig::from_env()?)?;
            let released = orch.force_unlock(case_id).await?;
            if released {
                println!("case {} lock released by terminating its holder", case_id);
            } else {
                println!("case {} had no lock holder to release", case_id);
            }
        }
        Command::Runs { case_id, limit } => {
            let store = PgRunStore::new(pools.runs);
            print_runs(&store.list_runs_for_case(case_id, limit).await?);
        }
        Command::OpenRuns { limit } => {
            let store = PgRunStore::new(pools.runs);
            print_runs(&store.list_open_runs(limit).await?);
        }
    }
    Ok(())
}

fn print_runs(runs: &[AgentRun]) {
    for run in runs {
        match serde_json::to_string(run) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(run_id = %run.run_id, error = %e, "could not serialize run"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap reports 0 for --help/--version and 2 for usage errors.
            let _ = e.print();
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(2));
        }
    };

    if let Err(e) = init_tracing(&TelemetryConfig::from_env()) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "caseguard-admin failed");
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Command, clap::Error> {
        Cli::try_parse_from(std::iter::once("caseguard-admin").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    fn case(id: i64) -> CaseId {
        CaseId::new(id).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(&["migrate"]).unwrap(), Command::Migrate);
        assert_eq!(
            parse(&["is-locked", "42"]).unwrap(),
            Command::IsLocked { case_id: case(42) }
        );
        assert_eq!(
            parse(&["force-unlock", "7"]).unwrap(),
            Command::ForceUnlock { case_id: case(7) }
        );
        assert_eq!(
            parse(&["runs", "7"]).unwrap(),
            Command::Runs {
                case_id: case(7),
                limit: DEFAULT_RUNS_LIMIT
            }
        );
        assert_eq!(
            parse(&["runs", "7", "5"]).unwrap(),
            Command::Runs {
                case_id: case(7),
                limit: 5
            }
        );
        assert_eq!(
            parse(&["open-runs"]).unwrap(),
            Command::OpenRuns {
                limit: DEFAULT_RUNS_LIMIT
            }
        );
        assert_eq!(
            parse(&["open-runs", "3"]).unwrap(),
            Command::OpenRuns { limit: 3 }
        );
    }

    #[test]
    fn test_bad_usage_exits_with_two() {
        for args in [
            &[][..],
            &["unlock", "1"][..],
            &["is-locked"][..],
            &["is-locked", "-3"][..],
            &["is-locked", "abc"][..],
            &["runs", "1", "many"][..],
            &["migrate", "now"][..],
        ] {
            let err = parse(args).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{:?}", args);
        }
    }

    #[test]
    fn test_help_exits_with_zero() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.exit_code(), 0);
    }
}
