// SPDX-License-Identifier: MIT

//! gantry - workflow engine CLI

mod client;
mod output;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gantry_core::{
    MatchPattern, SimpleStatus, StatusPredicate, SystemClock, TargetFilter, TargetId, TargetQuery,
    TargetSubmission, TimeConstraint,
};
use gantry_daemon::protocol::{
    DownMessage, FlatStateScope, ProcessUp, QueryOptions, UpMessage,
};
use std::path::PathBuf;

use crate::client::DaemonClient;

#[derive(Parser)]
#[command(name = "gantry", version, about = "Gantry - distributed workflow engine client")]
struct Cli {
    /// Config file (defaults to $GANTRY_CONFIG)
    #[arg(short = 'c', long = "config", global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Profile name (defaults to $GANTRY_PROFILE)
    #[arg(short = 'p', long = "profile", global = true)]
    profile: Option<String>,

    /// Token secret override
    #[arg(long = "token", global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show server status
    Status,
    /// Submit targets from a JSON file (an array of submissions)
    Submit {
        file: PathBuf,
    },
    /// List targets
    List {
        /// Restrict to a coarse status
        #[arg(long, value_parser = parse_simple_status)]
        status: Option<SimpleStatus>,
        /// Restrict to names matching a regex
        #[arg(long)]
        name: Option<String>,
        /// Only targets whose status changed in the last N seconds
        #[arg(long)]
        changed_within_s: Option<u64>,
        /// Wait up to N seconds for a non-empty result
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Show a target as JSON
    Show {
        id: String,
    },
    /// Show a target's state history
    Flat {
        id: String,
        /// Only entries at or after this epoch-millisecond stamp
        #[arg(long)]
        since: Option<u64>,
    },
    /// Kill targets
    Kill {
        ids: Vec<String>,
    },
    /// Restart terminal targets as fresh copies
    Restart {
        ids: Vec<String>,
    },
    /// List the diagnostic queries a target supports
    Queries {
        id: String,
    },
    /// Run a diagnostic query (e.g. stdout) against a target
    Query {
        id: String,
        name: String,
    },
    /// List run handles with a live process
    Running,
}

fn parse_simple_status(s: &str) -> Result<SimpleStatus, String> {
    match s {
        "activable" => Ok(SimpleStatus::Activable),
        "in-progress" => Ok(SimpleStatus::InProgress),
        "successful" => Ok(SimpleStatus::Successful),
        "failed" => Ok(SimpleStatus::Failed),
        other => Err(format!(
            "unknown status {other:?} (activable, in-progress, successful, failed)"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = cli
        .config
        .or_else(|| std::env::var("GANTRY_CONFIG").ok().map(PathBuf::from))
        .context("no config file: pass --config or set $GANTRY_CONFIG")?;
    let client = DaemonClient::from_config(&config, cli.profile.as_deref(), cli.token)?;

    match cli.command {
        Commands::Status => {
            let reply = client.call(UpMessage::GetServerStatus).await?;
            let DownMessage::ServerStatus { status } = reply else {
                bail!("unexpected reply: {reply:?}");
            };
            print!("{}", output::render_status(&status));
        }

        Commands::Submit { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let targets: Vec<TargetSubmission> =
                serde_json::from_str(&raw).context("parsing submissions")?;
            let reply = client.call(UpMessage::SubmitTargets { targets }).await?;
            let DownMessage::Submitted { mapping } = reply else {
                bail!("unexpected reply: {reply:?}");
            };
            for m in mapping {
                if m.submitted == m.stored {
                    println!("{}", m.stored);
                } else {
                    println!("{} -> {} (equivalent)", m.submitted, m.stored);
                }
            }
        }

        Commands::List {
            status,
            name,
            changed_within_s,
            wait,
        } => {
            let mut clauses = Vec::new();
            if let Some(status) = status {
                clauses.push(TargetFilter::Status(StatusPredicate::Simple(status)));
            }
            if let Some(name) = name {
                clauses.push(TargetFilter::Name(MatchPattern::Matches(name)));
            }
            let filter = match clauses.len() {
                0 => TargetFilter::True,
                1 => clauses.remove(0),
                _ => TargetFilter::And(clauses),
            };
            let time_constraint = match changed_within_s {
                Some(s) => {
                    use gantry_core::Clock;
                    TimeConstraint::StatusChangedSince(
                        SystemClock.epoch_ms().saturating_sub(s * 1000),
                    )
                }
                None => TimeConstraint::All,
            };

            let reply = client
                .call(UpMessage::GetTargetIds {
                    query: TargetQuery {
                        time_constraint,
                        filter,
                    },
                    options: QueryOptions {
                        block_if_empty_at_most: wait,
                    },
                })
                .await?;
            let ids = match reply {
                DownMessage::ListOfTargetIds { ids } => ids,
                DownMessage::DeferredListOfTargetIds { id, total } => {
                    let mut ids = Vec::with_capacity(total);
                    let mut index = 0;
                    while index < total {
                        let page = client
                            .call(UpMessage::GetDeferred {
                                id: id.clone(),
                                index,
                                length: 500,
                            })
                            .await?;
                        let DownMessage::ListOfTargetIds { ids: page } = page else {
                            bail!("deferred list expired; re-run the query");
                        };
                        if page.is_empty() {
                            break;
                        }
                        index += page.len();
                        ids.extend(page);
                    }
                    ids
                }
                other => bail!("unexpected reply: {other:?}"),
            };

            if ids.is_empty() {
                println!("no matching targets");
                return Ok(());
            }
            let reply = client
                .call(UpMessage::GetTargetSummaries { ids })
                .await?;
            let DownMessage::ListOfTargetSummaries { summaries } = reply else {
                bail!("unexpected reply: {reply:?}");
            };
            use gantry_core::Clock;
            print!(
                "{}",
                output::render_summaries(&summaries, SystemClock.epoch_ms())
            );
        }

        Commands::Show { id } => {
            let reply = client
                .call(UpMessage::GetTargets {
                    ids: vec![TargetId::new(id)],
                })
                .await?;
            let DownMessage::ListOfTargets { targets } = reply else {
                bail!("unexpected reply: {reply:?}");
            };
            for target in targets {
                println!("{}", serde_json::to_string_pretty(&target)?);
            }
        }

        Commands::Flat { id, since } => {
            let reply = client
                .call(UpMessage::GetTargetFlatStates {
                    scope: since.map(FlatStateScope::Since).unwrap_or_default(),
                    ids: vec![TargetId::new(id)],
                    options: QueryOptions::default(),
                })
                .await?;
            let DownMessage::ListOfTargetFlatStates { flat_states: flats } = reply else {
                bail!("unexpected reply: {reply:?}");
            };
            for flat in flats {
                print!("{}", output::render_flat_state(&flat));
            }
        }

        Commands::Kill { ids } => {
            let ids: Vec<TargetId> = ids.into_iter().map(TargetId::new).collect();
            client.call(UpMessage::KillTargets { ids }).await?;
            println!("kill requested");
        }

        Commands::Restart { ids } => {
            let ids: Vec<TargetId> = ids.into_iter().map(TargetId::new).collect();
            let reply = client.call(UpMessage::RestartTargets { ids }).await?;
            let DownMessage::Submitted { mapping } = reply else {
                bail!("unexpected reply: {reply:?}");
            };
            for m in mapping {
                if m.submitted == m.stored {
                    println!("{} is still being driven; left alone", m.stored);
                } else {
                    println!("{} -> {}", m.submitted, m.stored);
                }
            }
        }

        Commands::Queries { id } => {
            let reply = client
                .call(UpMessage::GetAvailableQueries {
                    id: TargetId::new(id),
                })
                .await?;
            match reply {
                DownMessage::QueryResult { result: names } => println!("{names}"),
                DownMessage::QueryError { error: e } => bail!("{e}"),
                other => bail!("unexpected reply: {other:?}"),
            }
        }

        Commands::Query { id, name } => {
            let reply = client
                .call(UpMessage::CallQuery {
                    id: TargetId::new(id),
                    query: name,
                })
                .await?;
            match reply {
                DownMessage::QueryResult { result } => print!("{result}"),
                DownMessage::QueryError { error: e } => bail!("{e}"),
                other => bail!("unexpected reply: {other:?}"),
            }
        }

        Commands::Running => {
            let reply = client.call(UpMessage::Process { request: ProcessUp::ListRunning }).await?;
            let DownMessage::Process { response: gantry_daemon::protocol::ProcessDown::RunningHandles(
                handles,
            ) } = reply
            else {
                bail!("unexpected reply: {reply:?}");
            };
            for handle in handles {
                println!("{handle}");
            }
        }
    }

    Ok(())
}
