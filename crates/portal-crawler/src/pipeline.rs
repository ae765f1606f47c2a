use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{OnError, PipelineConfig};
use crate::error::{ConfigError, ErrorKind, PipelineError, StoreError};
use crate::event::{Event, EventSink, LogSink, Outcome, Stage};
use crate::fetcher::Fetcher;
use crate::listing::{Discoverer, ListingItem};
use crate::record::RecordParser;
use crate::resource::{FetchOutcome, FieldValue, Record, ResourceDescriptor};
use crate::store::{ContentHash, ContentStore, HintLedger, RecordStore};

/// Run-level state. Only moves forward; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RunState {
    Discovering,
    Fetching,
    Parsing,
    Storing,
    Done,
    Failed { stage: Stage, reason: String },
}

impl RunState {
    fn rank(&self) -> u8 {
        match self {
            Self::Discovering => 0,
            Self::Fetching => 1,
            Self::Parsing => 2,
            Self::Storing => 3,
            Self::Done | Self::Failed { .. } => 4,
        }
    }

    fn reached(stage: Stage) -> Self {
        match stage {
            Stage::Discover => Self::Discovering,
            Stage::Fetch => Self::Fetching,
            Stage::Parse => Self::Parsing,
            Stage::Store => Self::Storing,
        }
    }

    /// Stage a failure at this point would be attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Discovering => Stage::Discover,
            Self::Fetching => Stage::Fetch,
            Self::Parsing => Stage::Parse,
            Self::Storing | Self::Done => Stage::Store,
            Self::Failed { stage, .. } => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// Moves to `next` if it lies further along. Returns whether it moved.
    pub fn advance(&mut self, next: RunState) -> bool {
        if self.is_terminal() || next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovering => f.write_str("discovering"),
            Self::Fetching => f.write_str("fetching"),
            Self::Parsing => f.write_str("parsing"),
            Self::Storing => f.write_str("storing"),
            Self::Done => f.write_str("done"),
            Self::Failed { stage, reason } => write!(f, "failed during {stage}: {reason}"),
        }
    }
}

/// A resource that could not be brought into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFailure {
    pub external_id: String,
    pub url: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

impl ResourceFailure {
    fn new(
        descriptor: &ResourceDescriptor,
        kind: ErrorKind,
        message: impl fmt::Display,
        attempts: u32,
    ) -> Self {
        Self {
            external_id: descriptor.external_id.clone(),
            url: descriptor.url.clone(),
            kind,
            message: message.to_string(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub discovered: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub parsed: usize,
    pub stored: usize,
    pub warnings: usize,
    pub listing_errors: usize,
    pub failures: Vec<ResourceFailure>,
    /// Resources a dry run would fetch
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub state: RunState,
    pub report: RunReport,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredObject {
    pub record_id: String,
    pub url: String,
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorReport {
    pub requested: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub without_link: usize,
    pub objects: Vec<MirroredObject>,
    pub failures: Vec<ResourceFailure>,
}

/// What happened to one discovered item.
enum Processed {
    PageError,
    Skipped,
    Failed {
        failure: ResourceFailure,
        stage: Stage,
    },
    Stored {
        parsed: usize,
        stored: usize,
        warnings: usize,
    },
}

/// A failure that ends the run.
struct RunFailure {
    stage: Stage,
    reason: String,
    resource: Option<ResourceFailure>,
}

impl RunFailure {
    fn new(stage: Stage, reason: impl fmt::Display) -> Self {
        Self {
            stage,
            reason: reason.to_string(),
            resource: None,
        }
    }
}

struct Run {
    state: RunState,
    report: RunReport,
}

impl Run {
    fn account(&mut self, processed: Processed) {
        let report = &mut self.report;
        match processed {
            Processed::PageError => report.listing_errors += 1,
            Processed::Skipped => {
                report.discovered += 1;
                report.skipped += 1;
                self.state.advance(RunState::Fetching);
            }
            Processed::Failed { failure, stage } => {
                report.discovered += 1;
                report.failed += 1;
                if stage != Stage::Fetch {
                    report.fetched += 1;
                }
                report.failures.push(failure);
                self.state.advance(RunState::reached(stage));
            }
            Processed::Stored {
                parsed,
                stored,
                warnings,
            } => {
                report.discovered += 1;
                report.fetched += 1;
                report.parsed += parsed;
                report.stored += stored;
                report.warnings += warnings;
                self.state.advance(RunState::Storing);
            }
        }
    }

    fn fail(&mut self, failure: RunFailure) {
        if let Some(resource) = failure.resource {
            self.report.discovered += 1;
            self.report.failed += 1;
            self.report.failures.push(resource);
        }
        self.state.advance(RunState::Failed {
            stage: failure.stage,
            reason: failure.reason,
        });
    }
}

/// Drives discovery, fetching, parsing and storing for one data directory.
pub struct Pipeline {
    config: PipelineConfig,
    content: Arc<ContentStore>,
    records: RecordStore,
    hints: Arc<HintLedger>,
    parser: RecordParser,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    /// Validates `config` and opens the stores under its data directory.
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let parser = RecordParser::new(config.record.clone()).map_err(|e| ConfigError {
            field: "record.tableSelector",
            reason: e.to_string(),
        })?;

        let content = Arc::new(ContentStore::open(&config.data_dir)?);
        let records = RecordStore::open(&config.data_dir, content.clone())?;
        let hints = Arc::new(HintLedger::open(config.data_dir.join("hints.json"))?);

        Ok(Self {
            config,
            content,
            records,
            hints,
            parser,
            sink: Arc::new(LogSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn hints(&self) -> &HintLedger {
        &self.hints
    }

    fn fetcher(&self, cancel: &CancellationToken) -> reqwest::Result<Fetcher> {
        Ok(Fetcher::new(self.config.fetch.clone())?
            .with_hints(self.hints.clone())
            .with_sink(self.sink.clone())
            .with_cancellation(cancel.clone()))
    }

    /// Runs one full pass over `portal_root`. Always ends in `Done` or
    /// `Failed`, with the report of everything that happened until then.
    pub async fn run(&self, portal_root: &str, cancel: CancellationToken) -> RunOutcome {
        let mut run = Run {
            state: RunState::Discovering,
            report: RunReport::default(),
        };

        let driven = self.drive(portal_root, &cancel, &mut run).await;
        // Hints must be durable before the run may count as done.
        let flushed = if self.config.dry_run {
            Ok(())
        } else {
            self.hints.flush()
        };

        match (driven, flushed) {
            (Err(failure), flushed) => {
                if let Err(e) = flushed {
                    log::error!("Couldn't save hints: {e}");
                }
                run.fail(failure);
            }
            (Ok(()), Err(e)) => run.fail(RunFailure::new(Stage::Store, e)),
            (Ok(()), Ok(())) if cancel.is_cancelled() => {
                let stage = run.state.stage();
                run.fail(RunFailure::new(stage, "cancelled"));
            }
            (Ok(()), Ok(())) => {
                run.state.advance(RunState::Done);
            }
        }

        let report = &run.report;
        log::info!(
            "Run {}: discovered={} fetched={} skipped={} failed={} parsed={} stored={} warnings={}",
            run.state,
            report.discovered,
            report.fetched,
            report.skipped,
            report.failed,
            report.parsed,
            report.stored,
            report.warnings,
        );

        RunOutcome {
            state: run.state,
            report: run.report,
        }
    }

    async fn drive(
        &self,
        portal_root: &str,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<(), RunFailure> {
        let fetcher = Arc::new(
            self.fetcher(cancel)
                .map_err(|e| RunFailure::new(Stage::Fetch, e))?,
        );
        let discoverer = Discoverer::new(fetcher.clone(), self.config.listing.clone())
            .exclude_titles(self.config.exclude_titles.clone())
            .extra_resources(self.config.extra_resources.clone())
            .with_sink(self.sink.clone());

        let discovery = discoverer
            .discover(portal_root)
            .await
            .map_err(|e| RunFailure::new(Stage::Discover, e))?;

        if self.config.dry_run {
            self.plan(discovery, run).await;
            return Ok(());
        }

        let mut processed = discovery
            .map(|item| self.process(&fetcher, item))
            .buffer_unordered(self.config.fetch.max_concurrency);

        while let Some(result) = processed.next().await {
            run.account(result?);
        }
        Ok(())
    }

    async fn plan(&self, mut discovery: BoxStream<'_, ListingItem>, run: &mut Run) {
        while let Some(item) = discovery.next().await {
            match item {
                ListingItem::Descriptor(descriptor) => {
                    run.report.discovered += 1;
                    let unchanged = descriptor
                        .last_modified_hint
                        .as_deref()
                        .map_or(false, |h| self.hints.is_unchanged(&descriptor.external_id, h));
                    if unchanged {
                        run.report.skipped += 1;
                    } else {
                        log::info!("Would fetch {} ({})", descriptor.external_id, descriptor.url);
                        run.report.planned.push(descriptor);
                    }
                }
                ListingItem::PageError { .. } => run.report.listing_errors += 1,
            }
        }
    }

    async fn process(&self, fetcher: &Fetcher, item: ListingItem) -> Result<Processed, RunFailure> {
        let descriptor = match item {
            ListingItem::Descriptor(descriptor) => descriptor,
            ListingItem::PageError { .. } => return Ok(Processed::PageError),
        };
        let id = descriptor.external_id.as_str();

        let payload = match fetcher.fetch(&descriptor).await {
            FetchOutcome::Success(payload) => payload,
            FetchOutcome::Skipped(_) => return Ok(Processed::Skipped),
            FetchOutcome::Failed { error, attempts } => {
                let failure = ResourceFailure::new(&descriptor, error.kind(), &error, attempts);
                return tolerate(self.config.on_fetch_error, Stage::Fetch, failure);
            }
        };

        self.content
            .put(&payload.bytes)
            .map_err(|e| self.store_failure(&descriptor, e))?;

        let batch = match self.parser.parse(&payload) {
            Ok(batch) => batch,
            Err(e) => {
                self.sink.emit(
                    &Event::new(Stage::Parse, id, Outcome::Failed).error(ErrorKind::Parse, &e),
                );
                let failure = ResourceFailure::new(&descriptor, ErrorKind::Parse, &e, 1);
                return tolerate(self.config.on_parse_error, Stage::Parse, failure);
            }
        };
        for warning in &batch.warnings {
            self.sink.emit(
                &Event::new(Stage::Parse, id, Outcome::Warning).error(
                    ErrorKind::Parse,
                    format!("row {}: {}", warning.row, warning.reason),
                ),
            );
        }
        let parsed = batch.records.len();
        self.sink.emit(
            &Event::new(Stage::Parse, id, Outcome::Success).detail(format!("{parsed} records")),
        );

        let mut stored = 0;
        for record in batch.records {
            let upsert = self
                .records
                .upsert(record)
                .map_err(|e| self.store_failure(&descriptor, e))?;
            if upsert.is_written() {
                stored += 1;
            }
        }
        self.sink.emit(
            &Event::new(Stage::Store, id, Outcome::Success)
                .detail(format!("{stored} of {parsed} records written")),
        );

        if let Some(hint) = &descriptor.last_modified_hint {
            self.hints.record(id, hint);
        }

        Ok(Processed::Stored {
            parsed,
            stored,
            warnings: batch.warnings.len(),
        })
    }

    fn store_failure(&self, descriptor: &ResourceDescriptor, e: StoreError) -> RunFailure {
        self.sink.emit(
            &Event::new(Stage::Store, &descriptor.external_id, Outcome::Failed)
                .error(ErrorKind::Store, &e),
        );
        RunFailure {
            stage: Stage::Store,
            reason: e.to_string(),
            resource: Some(ResourceFailure::new(descriptor, ErrorKind::Store, &e, 1)),
        }
    }

    /// Downloads what each record's link field points to into the content
    /// store. A link is fetched again only once the page it was listed on
    /// changed.
    pub async fn mirror(
        &self,
        records: impl IntoIterator<Item = Record>,
        cancel: CancellationToken,
    ) -> Result<MirrorReport, PipelineError> {
        let link_field = self.config.record.link_field.as_deref().ok_or(ConfigError {
            field: "record.linkField",
            reason: "must be set to mirror records".into(),
        })?;
        let fetcher = self.fetcher(&cancel)?;

        let mut report = MirrorReport::default();
        let mut targets = Vec::new();
        for record in records {
            report.requested += 1;
            match record.field(link_field).and_then(FieldValue::as_text) {
                Some(link) => targets.push((
                    record.record_id.clone(),
                    ResourceDescriptor::new(link).with_hint(record.source_content_hash.to_hex()),
                )),
                None => {
                    log::warn!("Record {} has no {link_field}", record.record_id);
                    report.without_link += 1;
                }
            }
        }

        let mut downloads = stream::iter(targets)
            .map(|(record_id, descriptor)| {
                let fetcher = &fetcher;
                async move {
                    let outcome = fetcher.fetch(&descriptor).await;
                    (record_id, descriptor, outcome)
                }
            })
            .buffer_unordered(self.config.fetch.max_concurrency);

        while let Some((record_id, descriptor, outcome)) = downloads.next().await {
            match outcome {
                FetchOutcome::Success(payload) => {
                    let content_hash = self.content.put(&payload.bytes)?;
                    if let Some(hint) = &descriptor.last_modified_hint {
                        self.hints.record(&descriptor.external_id, hint);
                    }
                    report.downloaded += 1;
                    report.objects.push(MirroredObject {
                        record_id,
                        url: descriptor.url,
                        content_hash,
                    });
                }
                FetchOutcome::Skipped(_) => report.skipped += 1,
                FetchOutcome::Failed { error, attempts } => {
                    report.failed += 1;
                    report.failures.push(ResourceFailure::new(
                        &descriptor,
                        error.kind(),
                        &error,
                        attempts,
                    ));
                }
            }
        }

        self.hints.flush()?;
        report.objects.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(report)
    }
}

fn tolerate(
    on_error: OnError,
    stage: Stage,
    failure: ResourceFailure,
) -> Result<Processed, RunFailure> {
    match on_error {
        OnError::Fail => Err(RunFailure {
            stage,
            reason: format!("{}: {}", failure.external_id, failure.message),
            resource: Some(failure),
        }),
        OnError::SkipAndLog => {
            log::warn!("Skipping {}: {}", failure.external_id, failure.message);
            Ok(Processed::Failed { failure, stage })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_moves_forward() {
        let mut state = RunState::Discovering;
        assert!(state.advance(RunState::Storing));
        assert!(!state.advance(RunState::Fetching));
        assert_eq!(state, RunState::Storing);
        assert!(state.advance(RunState::Done));
        assert!(!state.advance(RunState::Failed {
            stage: Stage::Store,
            reason: "late".into(),
        }));
        assert_eq!(state, RunState::Done);
    }

    #[test]
    fn failure_is_reachable_from_any_stage() {
        for mut state in [
            RunState::Discovering,
            RunState::Fetching,
            RunState::Parsing,
            RunState::Storing,
        ] {
            let stage = state.stage();
            assert!(state.advance(RunState::Failed {
                stage,
                reason: "boom".into(),
            }));
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn tolerated_failures_are_counted_per_stage() {
        let descriptor = ResourceDescriptor::new("https://example.org/a");
        let mut run = Run {
            state: RunState::Discovering,
            report: RunReport::default(),
        };
        let failure = ResourceFailure::new(&descriptor, ErrorKind::Parse, "bad table", 1);
        run.account(tolerate(OnError::SkipAndLog, Stage::Parse, failure).ok().unwrap());
        run.account(Processed::Skipped);

        assert_eq!(run.state, RunState::Parsing);
        assert_eq!(run.report.discovered, 2);
        assert_eq!(run.report.fetched, 1);
        assert_eq!(run.report.failed, 1);
        assert_eq!(run.report.skipped, 1);
    }

    #[test]
    fn fail_policy_ends_the_run() {
        let descriptor = ResourceDescriptor::new("https://example.org/a");
        let failure = ResourceFailure::new(&descriptor, ErrorKind::Client, "404", 1);
        let Err(fatal) = tolerate(OnError::Fail, Stage::Fetch, failure) else {
            panic!("expected a fatal failure");
        };
        let mut run = Run {
            state: RunState::Fetching,
            report: RunReport::default(),
        };
        run.fail(fatal);
        assert!(matches!(
            run.state,
            RunState::Failed {
                stage: Stage::Fetch,
                ..
            }
        ));
        assert_eq!(run.report.failures.len(), 1);
    }

    #[test]
    fn report_serializes_camel_case() {
        let outcome = RunOutcome {
            state: RunState::Failed {
                stage: Stage::Discover,
                reason: "root".into(),
            },
            report: RunReport::default(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"]["state"], "failed");
        assert_eq!(json["state"]["stage"], "discover");
        assert_eq!(json["report"]["listingErrors"], 0);
        assert!(json["report"].get("planned").is_none());
    }
}
