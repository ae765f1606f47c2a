mod config;
mod era;
mod error;
mod event;
mod fetcher;
mod limiter;
mod listing;
mod pipeline;
mod record;
mod resource;
mod select;
mod store;

pub use config::{
    ColumnKind, ColumnSpec, ExtraResource, FetchConfig, ListingConfig, ListingFormat, OnError,
    PipelineConfig, RecordSchema,
};
pub use era::{era_to_western, parse_year};
pub use error::{
    ConfigError, ErrorKind, FetchError, ListingError, ParseError, PipelineError, StoreError,
};
pub use event::{Event, EventSink, LogSink, MemorySink, Outcome, Stage};
pub use fetcher::Fetcher;
pub use limiter::{Permit, RateLimiter};
pub use listing::{parse_listing, Discoverer, ListingItem, ListingPage};
pub use pipeline::{
    MirrorReport, MirroredObject, Pipeline, ResourceFailure, RunOutcome, RunReport, RunState,
};
pub use record::{EntryWarning, ParsedBatch, RecordParser};
pub use resource::{
    FetchOutcome, FieldValue, RawPayload, Record, ResourceDescriptor, SkipReason,
};
pub use select::{Coverage, Preference, Reduction};
pub use store::{ContentHash, ContentStore, HintLedger, RecordFilter, RecordStore, Upsert};

pub use tokio_util::sync::CancellationToken;
