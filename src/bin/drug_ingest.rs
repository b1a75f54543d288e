use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use drug_rag::config::{AppConfig, ReingestPolicy, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use drug_rag::rag::RagEngine;
use drug_rag::telemetry;

#[derive(Parser, Debug)]
#[command(name = "drug-ingest")]
#[command(about = "Ingest OpenFDA drug labels into the RAG vector store")]
struct Args {
    /// Drug names to ingest
    #[arg(required = true)]
    drugs: Vec<String>,

    /// Configuration file
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Delete each drug's existing records before writing the new ones
    #[arg(long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::load_from(&args.config)?;
    if args.replace {
        config.pipeline.reingest = ReingestPolicy::Replace;
    }
    telemetry::init_tracing(&config.logging);

    println!("Initializing RAG engine...");
    let engine = RagEngine::from_config(&config).await?;

    let pb = ProgressBar::new(args.drugs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut total_facts = 0usize;
    let mut total_records = 0usize;
    let mut not_found: Vec<String> = Vec::new();
    let mut failed: Vec<(String, String)> = Vec::new();

    for drug in &args.drugs {
        pb.set_message(drug.clone());

        match engine.ingest(drug).await {
            Ok(summary) if summary.facts_fetched == 0 => not_found.push(summary.drug_name),
            Ok(summary) => {
                total_facts += summary.facts_fetched;
                total_records += summary.records_written;
            }
            Err(e) => {
                tracing::warn!("Failed to ingest {}: {}", drug, e);
                failed.push((drug.clone(), e.to_string()));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    let succeeded = args.drugs.len() - not_found.len() - failed.len();
    println!("\nIngestion complete!");
    println!("  Drugs ingested:  {}/{}", succeeded, args.drugs.len());
    println!("  Facts fetched:   {}", total_facts);
    println!("  Records written: {}", total_records);
    println!("  Store total:     {}", engine.count(None).await?);

    if !not_found.is_empty() {
        println!("\nNo OpenFDA record for: {}", not_found.join(", "));
    }
    if !failed.is_empty() {
        println!("\nFailed drugs:");
        for (drug, err) in &failed {
            println!("  {}: {}", drug, err);
        }
        anyhow::bail!("{} of {} drugs failed", failed.len(), args.drugs.len());
    }

    Ok(())
}
