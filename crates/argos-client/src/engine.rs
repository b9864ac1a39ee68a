//! Assembly of the bundled executors, providers and adapters.

use std::sync::Arc;

use argos_core::config::EngineConfig;
use argos_core::crawler::SuperCrawler;
use argos_core::error::AppError;
use argos_core::orchestrator::Orchestrator;
use argos_core::strategy::{Strategy, StrategyTable};
use argos_core::traits::Fetcher;

use crate::adapters::{AiAssist, ClinicalTrialsAdapter, PubChemApi, PubChemPatentAdapter, PubChemResolver};
use crate::challenge::ChallengeExecutor;
use crate::cleaner::HtmdCleaner;
use crate::http::HttpExecutor;
use crate::llm::ProviderTable;

/// Base URLs of the bundled sources.
#[derive(Debug, Clone)]
pub struct SourceEndpoints {
    pub pubchem: String,
    pub clinical_trials: String,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            pubchem: "https://pubchem.ncbi.nlm.nih.gov".into(),
            clinical_trials: "https://clinicaltrials.gov/api/v2".into(),
        }
    }
}

/// Plain, stealth and cookie-priming HTTP executors.
///
/// `allow_private_urls` lifts SSRF protection, for local mirrors and tests.
pub fn http_strategies(allow_private_urls: bool) -> Result<StrategyTable, AppError> {
    let (mut plain, mut stealth, mut challenge) = (
        HttpExecutor::plain()?,
        HttpExecutor::stealth()?,
        ChallengeExecutor::new()?,
    );
    if allow_private_urls {
        plain = plain.allow_private_urls();
        stealth = stealth.allow_private_urls();
        challenge = challenge.allow_private_urls();
    }
    Ok(StrategyTable::new()
        .with(Strategy::PlainHttp, Arc::new(plain))
        .with(Strategy::StealthHttp, Arc::new(stealth))
        .with(Strategy::ChallengeSolver, Arc::new(challenge)))
}

/// A crawler over `strategies` with the host and cache settings of `config`.
pub fn crawler(config: &EngineConfig, strategies: StrategyTable) -> SuperCrawler {
    SuperCrawler::new(strategies, config.crawler.clone())
        .with_hosts(config.host_registry())
        .with_cache(config.strategy_cache())
}

/// PubChem resolution, PubChem patents and ClinicalTrials.gov over `fetcher`.
///
/// Patent documents and trial studies that fail to parse go to the configured
/// providers under the budget in `config`.
pub fn pharma_orchestrator<F: Fetcher + 'static>(
    fetcher: F,
    config: &EngineConfig,
    providers: ProviderTable,
    endpoints: &SourceEndpoints,
) -> Result<Orchestrator, AppError> {
    config.validate()?;
    let pubchem = PubChemApi::new(&endpoints.pubchem)?;
    let ai = AiAssist::new(providers.into_decider(config.ai_budget.clone()), HtmdCleaner::new());

    let patents = PubChemPatentAdapter::new(fetcher.clone(), pubchem.clone()).with_ai(ai.clone());
    let trials = ClinicalTrialsAdapter::new(fetcher.clone(), &endpoints.clinical_trials)?.with_ai(ai);

    Ok(Orchestrator::new(config.orchestrator.clone())
        .with_resolver(Arc::new(PubChemResolver::new(fetcher, pubchem)))
        .with_adapter(Arc::new(patents))
        .with_adapter(Arc::new(trials)))
}
