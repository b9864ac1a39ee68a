pub mod adapters;
#[cfg(feature = "browser")]
pub mod browser;
pub mod challenge;
pub mod cleaner;
pub mod engine;
pub mod http;
pub mod llm;
pub mod ssrf;

pub use adapters::{AiAssist, ClinicalTrialsAdapter, PubChemApi, PubChemPatentAdapter, PubChemResolver};
#[cfg(feature = "browser")]
pub use browser::{BrowserExecutor, BrowserProfile, HeadlessBrowser};
pub use challenge::ChallengeExecutor;
pub use cleaner::HtmdCleaner;
pub use engine::{SourceEndpoints, crawler, http_strategies, pharma_orchestrator};
pub use http::{HttpExecutor, HttpProfile};
pub use llm::{OpenAiCompatibleProvider, ProviderTable};
