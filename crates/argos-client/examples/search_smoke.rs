/// Smoke test for a full search against the live sources.
///
/// Resolves the query through PubChem, then searches PubChem patents and
/// ClinicalTrials.gov in parallel and prints the categorized result as JSON.
/// AI fallback uses whichever provider keys are set in the environment or
/// in `.env`.
///
/// Run with:
///   cargo run --example search_smoke -- darolutamide
///   cargo run --example search_smoke --features browser -- darolutamide
use argos_client::{ProviderTable, SourceEndpoints, crawler, http_strategies, pharma_orchestrator};
use argos_core::config::EngineConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let query = std::env::args().nth(1).unwrap_or_else(|| "darolutamide".to_string());
    let config = EngineConfig::from_env()?;
    let providers = ProviderTable::from_env()?;
    println!("AI providers: {:?}", providers.names());

    let strategies = http_strategies(false)?;
    #[cfg(feature = "browser")]
    let strategies = argos_client::HeadlessBrowser::launch().await?.register(strategies);

    let fetcher = crawler(&config, strategies);
    let orchestrator =
        pharma_orchestrator(fetcher.clone(), &config, providers, &SourceEndpoints::default())?;

    println!("Searching for {query} …");
    let response = orchestrator.search(&query).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    println!(
        "{} records ({} patents, {} trials, {} molecules) in {} ms, partial: {}",
        response.records.total(),
        response.records.patents.len(),
        response.records.clinical_trials.len(),
        response.records.molecules.len(),
        response.metadata.elapsed_ms,
        response.is_partial()
    );
    println!("Crawler stats: {:?}", fetcher.stats().await);
    Ok(())
}
