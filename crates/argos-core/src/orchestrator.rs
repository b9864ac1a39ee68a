//! The search pipeline.
//!
//! A search runs in phases:
//!
//! 1. **Enrichment.** The subject resolver canonicalizes the query. If it
//!    fails, the raw query is used and the failure is reported.
//! 2. **Fan-out.** Every adapter is queried concurrently, at most
//!    `max_concurrency` at a time, each under its own timeout.
//! 3. **Expansion.** Cross-references the adapters returned are resolved
//!    into full records, up to `max_expansions`.
//! 4. **Dedup and scoring.**
//! 5. **Categorization.**
//!
//! The session deadline bounds phases 1-3. When it fires, whatever has
//! finished is kept, unfinished sources are listed as incomplete and the
//! response is flagged partial.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::categorize::Categorizer;
use crate::dedup::Deduplicator;
use crate::error::{SourceError, SourceErrorKind};
use crate::models::{CrossReference, Record, Subject};
use crate::scoring::{FieldWeights, QualityScorer};
use crate::session::{SearchResponse, SearchSession};
use crate::source::{AdapterOutput, QueryOptions, SourceAdapter, SubjectResolver};

/// Configuration for [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Overall budget for one search.
    pub session_deadline: Duration,
    /// Budget for a single adapter query or expansion.
    pub adapter_timeout: Duration,
    pub resolver_timeout: Duration,
    /// Adapters (or expansions) in flight at once.
    pub max_concurrency: usize,
    /// Cross-references expanded per search.
    pub max_expansions: usize,
    /// Source names, most trusted first, for merge tie-breaks.
    pub source_priority: Vec<String>,
    pub weights: FieldWeights,
    pub query_options: QueryOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_deadline: Duration::from_secs(120),
            adapter_timeout: Duration::from_secs(60),
            resolver_timeout: Duration::from_secs(20),
            max_concurrency: 4,
            max_expansions: 25,
            source_priority: Vec::new(),
            weights: FieldWeights::default(),
            query_options: QueryOptions::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = deadline;
        self
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    pub fn with_resolver_timeout(mut self, timeout: Duration) -> Self {
        self.resolver_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_max_expansions(mut self, max: usize) -> Self {
        self.max_expansions = max;
        self
    }

    pub fn with_source_priority(mut self, priority: Vec<String>) -> Self {
        self.source_priority = priority;
        self
    }
}

/// Runs searches across a resolver and a set of source adapters.
#[derive(Clone)]
pub struct Orchestrator {
    resolver: Option<Arc<dyn SubjectResolver>>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    config: Arc<OrchestratorConfig>,
    dedup: Deduplicator,
    scorer: QualityScorer,
    categorizer: Categorizer,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            resolver: None,
            adapters: Vec::new(),
            dedup: Deduplicator::new(config.source_priority.clone()),
            scorer: QualityScorer::new(config.weights.clone()),
            categorizer: Categorizer,
            config: Arc::new(config),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SubjectResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub async fn search(&self, query: &str) -> SearchResponse {
        self.search_with_cancel(query, &CancellationToken::new())
            .await
    }

    /// Run a search that stops early if `cancel` fires. Cancellation is
    /// reported like a deadline: finished sources are kept.
    pub async fn search_with_cancel(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> SearchResponse {
        let mut session = SearchSession::new(query, self.config.session_deadline, cancel)
            .with_options(self.config.query_options.clone());
        tracing::info!(
            query,
            adapters = self.adapters.len(),
            deadline_ms = self.config.session_deadline.as_millis() as u64,
            "Search started"
        );

        let subject = Arc::new(self.enrich(&mut session).await);
        self.fan_out(&mut session, &subject).await;
        self.expand(&mut session).await;

        let records = session.take_records();
        session.note_records_before_dedup(records.len());
        let mut records = self.dedup.deduplicate(records);
        self.scorer.score_all(&mut records);
        let categorized = self.categorizer.categorize(records);

        let response = session.finish(Arc::unwrap_or_clone(subject), categorized);
        tracing::info!(
            query,
            records = response.records.total(),
            partial = response.metadata.partial,
            errors = response.metadata.errors.len(),
            elapsed_ms = response.metadata.elapsed_ms,
            "Search finished"
        );
        response
    }

    async fn enrich(&self, session: &mut SearchSession) -> Subject {
        let query = session.query().to_string();
        let fallback = Subject::from_query(&query);
        let Some(resolver) = &self.resolver else {
            return fallback;
        };
        let name = resolver.name().to_string();
        session.attempt(&name);

        let ctx = session.context(self.config.resolver_timeout);
        let cancel = session.cancel_token().clone();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            r = tokio::time::timeout_at(ctx.deadline(), resolver.resolve(&query, &ctx)) => Some(r),
        };

        match result {
            Some(Ok(Ok(resolution))) => {
                session.record_success(&name);
                session.add_records(resolution.records);
                let mut subject = resolution.subject;
                if subject.query.is_empty() {
                    subject.query = query;
                }
                tracing::debug!(resolver = %name, subject = %subject.name, "Subject resolved");
                subject
            }
            Some(Ok(Err(e))) => {
                tracing::warn!(resolver = %name, error = %e, "Subject resolution failed, using raw query");
                session.record_error(SourceError::from_app_error(&name, &e));
                fallback
            }
            Some(Err(_)) if session.is_expired() => {
                session.mark_incomplete(&name, "session deadline reached during enrichment");
                fallback
            }
            Some(Err(_)) => {
                session.record_error(SourceError::new(
                    &name,
                    SourceErrorKind::Timeout,
                    format!("no resolution within {:?}", self.config.resolver_timeout),
                ));
                fallback
            }
            None => {
                session.mark_incomplete(&name, "search cancelled");
                fallback
            }
        }
    }

    async fn fan_out(&self, session: &mut SearchSession, subject: &Arc<Subject>) {
        let base = session.base_context();
        let timeout = self.config.adapter_timeout;
        let mut jobs = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let name = adapter.name().to_string();
            session.attempt(&name);
            let adapter = Arc::clone(adapter);
            let subject = Arc::clone(subject);
            let base = base.clone();
            let job: Job<AdapterOutput> = Box::pin(async move {
                let ctx = base.child(timeout);
                match tokio::time::timeout_at(ctx.deadline(), adapter.query(&subject, &ctx)).await {
                    Ok(output) => output,
                    Err(_) => {
                        ctx.cancel_token().cancel();
                        AdapterOutput::failed(SourceError::new(
                            adapter.name(),
                            SourceErrorKind::Timeout,
                            format!("no response within {timeout:?}"),
                        ))
                    }
                }
            });
            jobs.push((name, job));
        }

        let batch = run_bounded(
            jobs,
            self.config.max_concurrency,
            session.deadline(),
            session.cancel_token(),
        )
        .await;

        for (name, output) in batch.completed {
            tracing::debug!(
                source = %name,
                records = output.records.len(),
                errors = output.errors.len(),
                cross_references = output.cross_references.len(),
                "Source finished"
            );
            session.absorb(&name, output);
        }
        if let Some(reason) = batch.interrupted {
            for name in batch.unfinished {
                session.mark_incomplete(&name, reason.message());
            }
        }
    }

    async fn expand(&self, session: &mut SearchSession) {
        let references = session.take_cross_references();
        if references.is_empty() {
            return;
        }

        let known: HashSet<String> = session.records().iter().map(Record::identity_key).collect();
        let mut seen = HashSet::new();
        let mut selected: Vec<(Arc<dyn SourceAdapter>, CrossReference)> = Vec::new();
        let mut skipped = 0;
        for reference in references {
            let key = reference.identity_key();
            if known.contains(&key) || !seen.insert(key) {
                skipped += 1;
                continue;
            }
            let Some(adapter) = self.adapters.iter().find(|a| a.name() == reference.source) else {
                tracing::debug!(
                    source = %reference.source,
                    identifier = %reference.identifier,
                    "No adapter can expand cross-reference"
                );
                skipped += 1;
                continue;
            };
            if selected.len() >= self.config.max_expansions {
                skipped += 1;
                continue;
            }
            selected.push((Arc::clone(adapter), reference));
        }
        if skipped > 0 {
            tracing::debug!(
                skipped,
                cap = self.config.max_expansions,
                "Cross-references not expanded"
            );
        }

        let base = session.base_context();
        let timeout = self.config.adapter_timeout;
        let jobs: Vec<(String, Job<AdapterOutput>)> = selected
            .into_iter()
            .map(|(adapter, reference)| {
                let name = adapter.name().to_string();
                let base = base.clone();
                let job: Job<AdapterOutput> = Box::pin(async move {
                    let ctx = base.child(timeout);
                    match tokio::time::timeout_at(ctx.deadline(), adapter.expand(&reference, &ctx))
                        .await
                    {
                        Ok(output) => output,
                        Err(_) => {
                            ctx.cancel_token().cancel();
                            AdapterOutput::failed(SourceError::new(
                                adapter.name(),
                                SourceErrorKind::Timeout,
                                format!("expansion of {} timed out", reference.identifier),
                            ))
                        }
                    }
                });
                (name, job)
            })
            .collect();
        let requested = jobs.len();

        let batch = run_bounded(
            jobs,
            self.config.max_concurrency,
            session.deadline(),
            session.cancel_token(),
        )
        .await;

        let performed = batch.completed.len();
        for (name, mut output) in batch.completed {
            // Expansions do not chain.
            output.cross_references.clear();
            session.add_records(output.records);
            for error in output.errors {
                session.record_error(error);
            }
            tracing::trace!(source = %name, "Expansion finished");
        }
        if let Some(reason) = batch.interrupted {
            let mut sources: Vec<String> = batch.unfinished;
            sources.sort();
            sources.dedup();
            for name in sources {
                session.mark_incomplete(&name, reason.message());
            }
        }
        session.note_expansions(performed, skipped + (requested - performed));
    }
}

type Job<T> = BoxFuture<'static, T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Deadline,
    Cancelled,
}

impl Interruption {
    fn message(self) -> &'static str {
        match self {
            Interruption::Deadline => "session deadline reached before the source finished",
            Interruption::Cancelled => "search cancelled",
        }
    }
}

struct Batch<T> {
    completed: Vec<(String, T)>,
    /// Labels of jobs still running or never started when interrupted.
    unfinished: Vec<String>,
    interrupted: Option<Interruption>,
}

/// Run labelled jobs, at most `limit` at a time, until all finish, the
/// deadline passes or `cancel` fires. Jobs start lazily, so their own
/// timeouts count from when they begin running.
async fn run_bounded<T: Send + 'static>(
    jobs: Vec<(String, Job<T>)>,
    limit: usize,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Batch<T> {
    let limit = limit.max(1);
    let mut pending = jobs.into_iter();
    let mut running: Vec<String> = Vec::new();
    let mut in_flight = FuturesUnordered::new();
    let mut completed = Vec::new();

    let interrupted = loop {
        while in_flight.len() < limit {
            let Some((label, job)) = pending.next() else {
                break;
            };
            running.push(label.clone());
            in_flight.push(async move { (label, job.await) });
        }
        if in_flight.is_empty() {
            break None;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break Some(Interruption::Cancelled),
            () = tokio::time::sleep_until(deadline) => break Some(Interruption::Deadline),
            Some((label, value)) = in_flight.next() => {
                if let Some(pos) = running.iter().position(|l| *l == label) {
                    running.remove(pos);
                }
                completed.push((label, value));
            }
        }
    };

    // Dropping the stream drops in-flight jobs; their permits release on drop.
    drop(in_flight);
    running.extend(pending.map(|(label, _)| label));
    Batch {
        completed,
        unfinished: running,
        interrupted,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::crawler::{CrawlerConfig, SuperCrawler};
    use crate::error::AppError;
    use crate::fetch::FetchStatus;
    use crate::host::HostRegistry;
    use crate::models::RecordKind;
    use crate::rate_limiter::RateLimitConfig;
    use crate::source::{QueryContext, Resolution};
    use crate::strategy::{Strategy, StrategyTable};
    use crate::testutil::{MockAdapter, MockExecutor, MockResolver, good_page};
    use crate::traits::Fetcher;

    fn patent(id: &str, source: &str) -> Record {
        Record::new(RecordKind::Patent, id, "WO", source)
    }

    fn orchestrator(config: OrchestratorConfig, adapters: Vec<MockAdapter>) -> Orchestrator {
        adapters.into_iter().fold(Orchestrator::new(config), |o, a| {
            o.with_adapter(Arc::new(a))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn merges_and_categorizes_across_sources() {
        let wipo = MockAdapter::new("wipo").with_records(vec![
            patent("WO2020123456", "wipo").with_title("Crystalline salt"),
            Record::new(RecordKind::ClinicalTrial, "NCT01234567", "NCT", "wipo"),
        ]);
        let epo = MockAdapter::new("epo")
            .with_records(vec![patent("WO 2020/123456", "epo").with_description("Abstract")]);

        let response = orchestrator(OrchestratorConfig::default(), vec![wipo, epo])
            .search("aspirin")
            .await;

        assert!(!response.is_partial());
        assert_eq!(response.records.patents.len(), 1);
        assert_eq!(response.records.clinical_trials.len(), 1);
        let merged = &response.records.patents[0];
        assert_eq!(merged.title.as_deref(), Some("Crystalline salt"));
        assert_eq!(merged.description.as_deref(), Some("Abstract"));
        assert_eq!(merged.provenance.also_seen_in.len(), 1);
        assert!(merged.quality_score > 0);
        assert_eq!(response.metadata.records_before_dedup, 3);
        assert_eq!(response.metadata.sources_succeeded.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_finished_sources_and_flags_the_rest() {
        let adapters = vec![
            MockAdapter::new("fast_a")
                .with_records(vec![patent("WO1", "fast_a")])
                .with_delay(Duration::from_secs(1)),
            MockAdapter::new("fast_b")
                .with_records(vec![patent("WO2", "fast_b")])
                .with_delay(Duration::from_secs(2)),
            MockAdapter::new("slow_a")
                .with_records(vec![patent("WO3", "slow_a")])
                .with_delay(Duration::from_secs(300)),
            MockAdapter::new("slow_b").with_delay(Duration::from_secs(300)),
        ];
        let config = OrchestratorConfig::default()
            .with_session_deadline(Duration::from_secs(10))
            .with_adapter_timeout(Duration::from_secs(60));

        let started = Instant::now();
        let response = orchestrator(config, adapters).search("aspirin").await;

        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(response.is_partial());
        assert_eq!(response.records.patents.len(), 2);
        let mut incomplete = response.metadata.sources_incomplete.clone();
        incomplete.sort();
        assert_eq!(incomplete, vec!["slow_a", "slow_b"]);
        assert!(response.metadata.errors.iter().all(SourceError::is_incomplete));
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_timeout_is_a_source_error() {
        let slow = MockAdapter::new("slow").with_delay(Duration::from_secs(30));
        let config = OrchestratorConfig::default()
            .with_session_deadline(Duration::from_secs(60))
            .with_adapter_timeout(Duration::from_secs(5));

        let response = orchestrator(config, vec![slow]).search("q").await;

        assert!(response.is_partial());
        assert_eq!(response.metadata.errors[0].kind, SourceErrorKind::Timeout);
        assert!(response.metadata.sources_incomplete.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let adapters = (0..3)
            .map(|i| MockAdapter::new(format!("a{i}")).with_delay(Duration::from_secs(1)))
            .collect();
        let config = OrchestratorConfig::default().with_max_concurrency(1);

        let started = Instant::now();
        let response = orchestrator(config, adapters).search("q").await;

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(response.metadata.sources_succeeded.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_failure_falls_back_to_raw_query() {
        let adapter = MockAdapter::new("wipo");
        let o = Orchestrator::new(OrchestratorConfig::default())
            .with_resolver(Arc::new(MockResolver::failing("pubchem", "503 from upstream")))
            .with_adapter(Arc::new(adapter.clone()));

        let response = o.search("  ABC-1234 ").await;

        assert_eq!(response.subject.name, "ABC-1234");
        assert!(response.is_partial());
        assert_eq!(response.metadata.errors[0].source, "pubchem");
        assert_eq!(adapter.subjects(), vec!["ABC-1234"]);
    }

    #[tokio::test(start_paused = true)]
    async fn adapters_see_the_resolved_subject() {
        let mut subject = Subject::from_query("abc-1234");
        subject.name = "Examplinib".into();
        subject.codes = vec!["ABC-1234".into()];
        let resolution = Resolution {
            subject,
            records: vec![Record::new(RecordKind::Molecule, "Examplinib", "MOL", "pubchem")],
        };
        let adapter = MockAdapter::new("ctgov");
        let o = Orchestrator::new(OrchestratorConfig::default())
            .with_resolver(Arc::new(MockResolver::ok("pubchem", resolution)))
            .with_adapter(Arc::new(adapter.clone()));

        let response = o.search("abc-1234").await;

        assert_eq!(adapter.subjects(), vec!["Examplinib"]);
        assert_eq!(response.records.molecules.len(), 1);
        assert_eq!(response.metadata.sources_succeeded, vec!["pubchem", "ctgov"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cross_references_are_expanded_up_to_the_cap() {
        let xrefs = vec![
            CrossReference::new("pubchem", RecordKind::Patent, "WO2020000001"),
            CrossReference::new("pubchem", RecordKind::Patent, "WO2020000002"),
            CrossReference::new("pubchem", RecordKind::Patent, "WO2020000003"),
            // Already returned in full below.
            CrossReference::new("pubchem", RecordKind::Patent, "WO2020123456"),
        ];
        let pubchem = MockAdapter::new("pubchem")
            .with_records(vec![patent("WO2020123456", "pubchem").with_title("Known")])
            .with_cross_references(xrefs);
        let config = OrchestratorConfig::default().with_max_expansions(2);

        let response = orchestrator(config, vec![pubchem.clone()]).search("q").await;

        let mut expanded = pubchem.expanded();
        expanded.sort();
        assert_eq!(expanded, vec!["WO2020000001", "WO2020000002"]);
        assert_eq!(response.records.patents.len(), 3);
        assert_eq!(response.metadata.expansions_performed, 2);
        assert_eq!(response.metadata.expansions_skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_marks_sources_incomplete() {
        let slow = MockAdapter::new("slow").with_delay(Duration::from_secs(30));
        let o = orchestrator(OrchestratorConfig::default(), vec![slow]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let response = o.search_with_cancel("q", &cancel).await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(response.metadata.sources_incomplete, vec!["slow"]);
        assert_eq!(response.metadata.errors[0].message, "search cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn no_adapters_yields_empty_response() {
        let response = Orchestrator::new(OrchestratorConfig::default())
            .search("q")
            .await;
        assert_eq!(response.records.total(), 0);
        assert!(!response.is_partial());
    }

    // ------------------------------------------------------------------
    // Through a real crawler
    // ------------------------------------------------------------------

    /// Fetches one page per query and turns it into a patent record.
    struct CrawlingAdapter {
        crawler: SuperCrawler,
        url: String,
    }

    #[async_trait]
    impl SourceAdapter for CrawlingAdapter {
        fn name(&self) -> &str {
            "registry"
        }

        async fn query(&self, _subject: &Subject, ctx: &QueryContext) -> AdapterOutput {
            let request = match ctx.fetch_request(&self.url) {
                Ok(r) => r.with_strategies([Strategy::PlainHttp]),
                Err(e) => return AdapterOutput::failed(SourceError::from_app_error(self.name(), &e)),
            };
            let result = self.crawler.fetch(&request).await;
            match result.status {
                FetchStatus::Success => AdapterOutput::from_records(vec![patent("WO1", self.name())]),
                _ => {
                    let err = result
                        .error
                        .unwrap_or_else(|| AppError::Generic("fetch failed".into()));
                    AdapterOutput::failed(SourceError::from_app_error(self.name(), &err))
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_the_source_fast() {
        let executor = MockExecutor::ok(&good_page("registry page"));
        let hosts = HostRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
            RateLimitConfig::default(),
        );
        let crawler = SuperCrawler::new(
            StrategyTable::new().with(Strategy::PlainHttp, Arc::new(executor.clone())),
            CrawlerConfig::default(),
        )
        .with_hosts(hosts.clone());
        hosts
            .get("registry.example")
            .circuit
            .record_failure(&AppError::NetworkError("reset".into()));

        let o = Orchestrator::new(OrchestratorConfig::default()).with_adapter(Arc::new(
            CrawlingAdapter {
                crawler,
                url: "https://registry.example/search?q=x".into(),
            },
        ));

        let started = Instant::now();
        let response = o.search("x").await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(executor.call_count(), 0);
        assert!(response.is_partial());
        assert!(response.metadata.sources_succeeded.is_empty());
        assert_eq!(response.metadata.errors[0].kind, SourceErrorKind::CircuitOpen);
    }
}
