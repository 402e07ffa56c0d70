use anyhow::Result;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use offboard_pipeline::{run_delete, run_resolve, run_verify, RunConfig, ServiceClients};
use offboard_storage::{read_artifact, read_roster};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offboard")]
#[command(about = "Batch user offboarding across the admin directory and the identity provider")]
struct Cli {
    /// Deployment region hosting both services (eu or us).
    #[arg(long, global = true)]
    region: Option<String>,

    /// Skip the confirmation prompt (non-interactive runs).
    #[arg(long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stage 1: resolve every roster email to its provider ID.
    Resolve,
    /// Stage 2: delete resolved users from both services.
    Delete,
    /// Stage 3: re-query both services and report anything left behind.
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = RunConfig::from_env(cli.region.as_deref())?;
    let clients = ServiceClients::from_config(&config)?;

    match cli.command {
        Commands::Resolve => {
            let roster = read_roster(&config.roster_path)?;
            print_preview(&config, "resolve", roster.len(), false);
            let prompt = format!("Look up {} emails in the identity provider?", roster.len());
            if !confirmed(cli.yes, &prompt)? {
                println!("Aborted; nothing was written.");
                return Ok(());
            }

            let summary = run_resolve(&config, &clients).await?;
            println!();
            println!("resolve complete: run_id={}", summary.run_id);
            println!("  found:     {}", summary.counts.found);
            println!("  not found: {}", summary.counts.not_found);
            println!("  errors:    {}", summary.counts.errors);
            println!("  artifact:  {}", summary.artifact_path);
        }
        Commands::Delete => {
            let records = read_artifact(&config.artifact_path)?;
            print_preview(&config, "delete", records.len(), true);
            let prompt = format!(
                "Permanently delete {} users from both services?",
                records.len()
            );
            if !confirmed(cli.yes, &prompt)? {
                println!("Aborted; nothing was deleted.");
                return Ok(());
            }

            let summary = run_delete(&config, &clients).await?;
            println!();
            println!("delete complete: run_id={}", summary.run_id);
            println!(
                "  admin:    {} deleted, {} already absent, {} failed",
                summary.admin.deleted, summary.admin.not_found, summary.admin.failed
            );
            println!(
                "  provider: {} deleted, {} already absent, {} failed, {} skipped",
                summary.provider.deleted,
                summary.provider.not_found,
                summary.provider.failed,
                summary.provider.skipped
            );
            if summary.provider_auth_failures > 0 {
                println!(
                    "  WARNING: {} provider calls failed with 401/403; check the token and its scopes",
                    summary.provider_auth_failures
                );
            }
        }
        Commands::Verify => {
            let records = read_artifact(&config.artifact_path)?;
            print_preview(&config, "verify", records.len(), false);
            let prompt = format!("Re-check {} users against both services?", records.len());
            if !confirmed(cli.yes, &prompt)? {
                println!("Aborted.");
                return Ok(());
            }

            let summary = run_verify(&config, &clients).await?;
            println!();
            println!("verify complete: run_id={}", summary.run_id);
            println!(
                "  admin:    {} gone, {} still exist, {} inconclusive",
                summary.admin.gone, summary.admin.still_exists, summary.admin.check_errors
            );
            println!(
                "  provider: {} gone, {} still exist, {} inconclusive, {} skipped",
                summary.provider.gone,
                summary.provider.still_exists,
                summary.provider.check_errors,
                summary.provider.skipped
            );
            if summary.passed() {
                println!("VERDICT: SUCCESS, no offboarded user remains in either service");
            } else {
                let leftovers = summary.admin.still_exists + summary.provider.still_exists;
                println!(
                    "VERDICT: FAILURE, {leftovers} checks still return a user; see the discrepancy log"
                );
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_preview(config: &RunConfig, stage: &str, records: usize, mutating: bool) {
    println!(
        "stage:    {stage}{}",
        if mutating { " (mutating)" } else { "" }
    );
    println!("region:   {}", config.region);
    println!("admin:    {}", config.admin_base_url);
    println!("provider: {}", config.provider_base_url);
    println!("records:  {records}");
}

fn confirmed(skip_prompt: bool, prompt: &str) -> Result<bool> {
    if skip_prompt {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
