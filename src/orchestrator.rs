//! Drives one screening run: serve what the cache already knows, analyse the
//! rest under the cross-tab lock, and remember every new result.

use crate::criteria::{HardFilters, WeightCriteria};
use crate::fingerprint::{FileDescriptor, FingerprintError};
use crate::lock::Exclusive;
use crate::service::AnalysisService;
use futures::future::LocalBoxFuture;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Inputs that decide whether a stored analysis can be reused.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisRequest {
    pub jd_text: String,
    pub weights: WeightCriteria,
    pub filters: HardFilters,
}

/// The expensive path, typically a remote model call.
pub trait CandidateAnalyzer<R> {
    type Error;

    /// One outcome per file, in the order given. A per-file `Err` marks that
    /// file as failed; the outer `Err` aborts the whole run.
    fn analyze<'a>(
        &'a self,
        request: &'a AnalysisRequest,
        files: &'a [FileDescriptor],
    ) -> LocalBoxFuture<'a, Result<Vec<Result<R, String>>, Self::Error>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent<R> {
    Progress(String),
    Cached { file: FileDescriptor, result: R },
    Analyzed { file: FileDescriptor, result: R },
    Failed { file: FileDescriptor, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub cached: usize,
    pub analyzed: usize,
    pub failed: usize,
    /// Another tab held the lock, so uncached files were left alone.
    pub denied: bool,
}

#[derive(Debug)]
pub enum RunError<E> {
    Context(FingerprintError),
    Analyzer(E),
}

impl<E: fmt::Display> fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Context(e) => write!(f, "Could not hash analysis inputs: {}", e),
            RunError::Analyzer(e) => write!(f, "Analysis failed: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RunError<E> {}

pub struct AnalysisOrchestrator<'s, R, A> {
    service: &'s AnalysisService<R>,
    analyzer: A,
}

impl<'s, R, A> AnalysisOrchestrator<'s, R, A>
where
    R: Serialize + DeserializeOwned,
    A: CandidateAnalyzer<R>,
{
    pub fn new(service: &'s AnalysisService<R>, analyzer: A) -> Self {
        Self { service, analyzer }
    }

    pub async fn run(
        &self,
        request: &AnalysisRequest,
        files: &[FileDescriptor],
        on_event: impl Fn(AnalysisEvent<R>),
    ) -> Result<RunSummary, RunError<A::Error>> {
        let context = self
            .service
            .analysis_hashes(&request.jd_text, &request.weights, &request.filters)
            .map_err(RunError::Context)?;
        let resolution = self.service.resolve(files, &context);
        let mut summary = RunSummary { cached: resolution.cached.len(), ..RunSummary::default() };

        if summary.cached > 0 {
            on_event(AnalysisEvent::Progress(format!(
                "Found {} cached results, loading",
                summary.cached
            )));
        }
        for hit in resolution.cached {
            on_event(AnalysisEvent::Cached { file: hit.file, result: hit.result });
        }

        let uncached = &resolution.uncached;
        if uncached.is_empty() {
            on_event(AnalysisEvent::Progress("Every file was already cached".to_string()));
            return Ok(summary);
        }

        on_event(AnalysisEvent::Progress(format!("Analysing {} new files", uncached.len())));
        let service = self.service;
        let analyzer = &self.analyzer;
        let context = &context;
        let on_event = &on_event;
        let outcome = service
            .run_exclusive(move || async move {
                let outcomes = analyzer.analyze(request, uncached).await?;
                if outcomes.len() != uncached.len() {
                    warn!(
                        "Analyzer returned {} outcomes for {} files",
                        outcomes.len(),
                        uncached.len()
                    );
                }

                let mut outcomes = outcomes.into_iter();
                let (mut analyzed, mut failed) = (0, 0);
                for file in uncached {
                    match outcomes.next() {
                        Some(Ok(result)) => {
                            service.cache_analysis(file, &result, context);
                            analyzed += 1;
                            on_event(AnalysisEvent::Analyzed { file: file.clone(), result });
                        }
                        Some(Err(error)) => {
                            failed += 1;
                            on_event(AnalysisEvent::Failed { file: file.clone(), error });
                        }
                        None => {
                            failed += 1;
                            on_event(AnalysisEvent::Failed {
                                file: file.clone(),
                                error: "no result returned".to_string(),
                            });
                        }
                    }
                }
                Ok::<_, A::Error>((analyzed, failed))
            })
            .await
            .map_err(RunError::Analyzer)?;

        match outcome {
            Exclusive::Ran((analyzed, failed)) => {
                summary.analyzed = analyzed;
                summary.failed = failed;
                on_event(AnalysisEvent::Progress(format!(
                    "Done, the cache now holds {} entries",
                    service.cache_stats().size
                )));
            }
            Exclusive::Denied => {
                summary.denied = true;
                on_event(AnalysisEvent::Progress(
                    "Another tab is analysing, try again when it finishes".to_string(),
                ));
            }
        }
        info!(
            "Run finished: {} cached, {} analysed, {} failed, denied={}",
            summary.cached, summary.analyzed, summary.failed, summary.denied
        );
        Ok(summary)
    }
}
