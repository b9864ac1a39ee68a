pub mod ai_fallback;
pub mod block;
pub mod categorize;
pub mod circuit_breaker;
pub mod config;
pub mod crawler;
pub mod dedup;
pub mod error;
pub mod extraction;
pub mod failure_log;
pub mod fetch;
pub mod host;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod scoring;
pub mod session;
pub mod source;
pub mod strategy;
pub mod traits;
pub mod util;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use ai_fallback::AiFallbackDecider;
pub use config::EngineConfig;
pub use crawler::{CrawlerConfig, SuperCrawler};
pub use error::{AppError, SourceError, SourceErrorKind};
pub use fetch::{FetchRequest, FetchResult, FetchStatus, RawResponse};
pub use models::{CrossReference, Record, RecordKind, Subject, compute_hash};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use session::{SearchMetadata, SearchResponse};
pub use source::{AdapterOutput, QueryContext, Resolution, SourceAdapter, SubjectResolver};
pub use strategy::Strategy;
pub use traits::{Cleaner, ExtractionProvider, Fetcher, StrategyExecutor};
