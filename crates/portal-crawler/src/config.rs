use std::cmp;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::select::Reduction;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub portal_root: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub listing: ListingConfig,

    #[serde(default)]
    pub record: RecordSchema,

    #[serde(default = "default_on_fetch_error")]
    pub on_fetch_error: OnError,

    #[serde(default = "default_on_parse_error")]
    pub on_parse_error: OnError,

    #[serde(default)]
    pub exclude_titles: Vec<String>,

    #[serde(default)]
    pub extra_resources: Vec<ExtraResource>,

    #[serde(default)]
    pub dry_run: bool,

    /// Narrows the records `list` and `mirror` act on
    #[serde(default)]
    pub reduction: Reduction,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            portal_root: None,
            data_dir: default_data_dir(),
            fetch: FetchConfig::default(),
            listing: ListingConfig::default(),
            record: RecordSchema::default(),
            on_fetch_error: default_on_fetch_error(),
            on_parse_error: default_on_parse_error(),
            exclude_titles: Vec::new(),
            extra_resources: Vec::new(),
            dry_run: false,
            reduction: Reduction::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fetch.validate()?;
        if self.record.id_columns.is_empty() {
            return Err(ConfigError {
                field: "record.idColumns",
                reason: "must name at least one column".into(),
            });
        }
        if self.listing.item_selector.trim().is_empty() {
            return Err(ConfigError {
                field: "listing.itemSelector",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_on_fetch_error() -> OnError {
    OnError::SkipAndLog
}

fn default_on_parse_error() -> OnError {
    OnError::SkipAndLog
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OnError {
    Fail,
    SkipAndLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// The maximum number of requests in flight
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Bounds both connection and total transfer time
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// The minimum delay between two request starts against the same host
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError {
                field: "fetch.maxConcurrency",
                reason: "must be greater than 0".into(),
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError {
                field: "fetch.timeoutMs",
                reason: "must be greater than 0".into(),
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError {
                field: "fetch.backoffMaxMs",
                reason: format!("must be at least backoffBaseMs ({})", self.backoff_base_ms),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Un-jittered wait before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(cmp::min(delay, self.backoff_max_ms))
    }
}

fn default_user_agent() -> String {
    String::from("PortalHarvester/0.1")
}

fn default_max_concurrency() -> usize {
    cmp::max(1, num_cpus::get().saturating_sub(2))
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

fn default_min_interval_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListingFormat {
    #[default]
    Auto,
    Html,
    Sitemap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingConfig {
    #[serde(default)]
    pub format: ListingFormat,

    /// Anchors pointing at resource pages
    #[serde(default = "default_item_selector")]
    pub item_selector: String,

    /// Attribute of the item holding its last-modified hint
    #[serde(default)]
    pub hint_attr: Option<String>,

    /// Attribute of the item used as external id instead of its resolved url
    #[serde(default)]
    pub id_attr: Option<String>,

    /// Anchors pointing at the next page of the same listing
    #[serde(default)]
    pub next_page_selector: Option<String>,

    /// Anchors pointing at nested listing pages
    #[serde(default)]
    pub child_listing_selector: Option<String>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            format: ListingFormat::default(),
            item_selector: default_item_selector(),
            hint_attr: None,
            id_attr: None,
            next_page_selector: None,
            child_listing_selector: None,
        }
    }
}

fn default_item_selector() -> String {
    String::from("li.collection-item a")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnKind {
    #[default]
    Text,
    Number,
    Timestamp,
    /// Western or Japanese-era year, stored as a number
    Year,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ColumnKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSchema {
    #[serde(default = "default_table_selector")]
    pub table_selector: String,

    #[serde(default = "default_id_columns")]
    pub id_columns: Vec<String>,

    /// Typed or required columns, any other header is kept as text
    #[serde(default = "default_columns")]
    pub columns: Vec<ColumnSpec>,

    /// Headers whose cells are dropped
    #[serde(default = "default_ignore_columns")]
    pub ignore_columns: Vec<String>,

    #[serde(default = "default_link_field")]
    pub link_field: Option<String>,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            table_selector: default_table_selector(),
            id_columns: default_id_columns(),
            columns: default_columns(),
            ignore_columns: default_ignore_columns(),
            link_field: default_link_field(),
        }
    }
}

impl RecordSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn default_table_selector() -> String {
    String::from("table.responsive-table")
}

fn default_id_columns() -> Vec<String> {
    vec![String::from("ファイル名")]
}

fn default_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec {
            name: String::from("ファイル名"),
            kind: ColumnKind::Text,
            required: true,
        },
        ColumnSpec {
            name: String::from("年度"),
            kind: ColumnKind::Year,
            required: false,
        },
    ]
}

fn default_ignore_columns() -> Vec<String> {
    vec![String::from("ダウンロード")]
}

fn default_link_field() -> Option<String> {
    Some(String::from("link"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraResource {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}
