use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gdp_adapters::ReplayAdapter;
use gdp_core::RunTrigger;
use gdp_storage::PgGrantStore;
use gdp_sync::{report_recent_runs_markdown, DiscoveryPipeline, DiscoveryRequest, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gdp-cli")]
#[command(about = "Grant discovery pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one discovery pass and import matches.
    Discover {
        #[command(flatten)]
        target: TargetArgs,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Rank matching opportunities without importing anything.
    Search {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Serve the HTTP trigger and search endpoints.
    Serve,
    /// Apply database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Summarize recent runs from the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long, env = "GDP_REPORTS_DIR", default_value = "./reports")]
        reports_dir: PathBuf,
    },
    /// Print the active keyword taxonomy.
    Taxonomy {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Default, Args)]
struct TargetArgs {
    /// Comma-separated taxonomy tags; all tags when omitted.
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
    /// Include backward-looking award and declaration registries.
    #[arg(long)]
    historical: bool,
    /// Serve recorded `<source-id>.json` bodies from this directory instead of
    /// calling the live APIs.
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,
}

impl TargetArgs {
    fn request(&self) -> DiscoveryRequest {
        DiscoveryRequest::new(RunTrigger::Cli)
            .with_tags(self.tags.clone())
            .with_historical(self.historical)
    }

    async fn pipeline(&self, config: SyncConfig) -> Result<DiscoveryPipeline> {
        let pipeline = DiscoveryPipeline::from_config(config).await?;
        Ok(match &self.replay {
            Some(dir) => {
                info!(dir = %dir.display(), "replaying recorded responses");
                pipeline.with_adapters(ReplayAdapter::load_fixture_dir(dir)?)
            }
            None => pipeline,
        })
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gdp=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Discover {
        target: TargetArgs::default(),
        json: false,
    }) {
        Commands::Discover { target, json } => {
            let pipeline = target.pipeline(config).await?;
            let summary = pipeline.run_once(&target.request()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "discovery complete: run_id={} discovered={} imported={} updated={} skipped={} high_priority={} errors={} timed_out={}",
                    summary.run_id,
                    summary.discovered,
                    summary.imported,
                    summary.updated,
                    summary.skipped,
                    summary.high_priority,
                    summary.errors.len(),
                    summary.timed_out
                );
                for error in &summary.errors {
                    println!("  error: {error}");
                }
            }
        }
        Commands::Search { target, limit } => {
            let pipeline = target.pipeline(config).await?;
            let results = pipeline.search(&target.request(), Some(limit)).await?;
            for scored in &results.results {
                let opp = &scored.opportunity;
                println!(
                    "{:>3} {:>3}% {:<8} {:<18} {} [{}]",
                    scored.match_score,
                    scored.win_probability,
                    scored.priority().as_str(),
                    opp.source.as_str(),
                    opp.title,
                    scored.matched_tags.join(",")
                );
            }
            for error in &results.errors {
                eprintln!("error: {error}");
            }
        }
        Commands::Serve => gdp_web::serve_from_env().await?,
        Commands::Migrate { database_url } => {
            let store = PgGrantStore::connect(&database_url)
                .await
                .context("connecting to grant database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Report { runs, reports_dir } => {
            println!("{}", report_recent_runs_markdown(&reports_dir, runs)?);
        }
        Commands::Taxonomy { json } => {
            let taxonomy = config.load_taxonomy()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&taxonomy)?);
            } else {
                println!("taxonomy {}", taxonomy.version());
                for tag in taxonomy.tags() {
                    println!("  {:<24} {}", tag.tag, tag.keywords.join(", "));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn discover_flags_build_request() {
        let cli = Cli::try_parse_from([
            "gdp-cli",
            "discover",
            "--tags",
            "rural-health,veterans",
            "--historical",
            "--replay",
            "fixtures",
        ])
        .unwrap();
        let Some(Commands::Discover { target, json }) = cli.command else {
            panic!("expected discover");
        };
        assert!(!json);
        assert_eq!(target.replay, Some(PathBuf::from("fixtures")));
        let request = target.request();
        assert_eq!(request.tags, vec!["rural-health", "veterans"]);
        assert!(request.include_historical);
        assert_eq!(request.trigger, RunTrigger::Cli);
    }
}
