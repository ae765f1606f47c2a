use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use portal_crawler::{
    CancellationToken, OnError, Pipeline, PipelineConfig, Preference, RawPayload, Record,
    RecordFilter, RecordParser, Reduction,
};
use tokio::runtime;

/// Dataset portal harvester
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    Run(RunArgs),
    Parse(ParseArgs),
    List(ListArgs),
    Mirror(MirrorArgs),
    #[command(hide = true)]
    Completion {
        #[arg(value_enum, default_value_t = Shell::Bash)]
        shell: Shell,
    },
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// Optional yaml pipeline configuration file
    #[arg(env = "PORTAL_CONFIG", long, short)]
    pub config: Option<PathBuf>,
    /// Override the directory holding objects, records and hints
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl TryFrom<&ConfigArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ConfigArgs) -> Result<Self, Self::Error> {
        let mut conf: PipelineConfig = match &args.config {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Couldn't open {}", path.display()))?;
                serde_yaml::from_reader(file)
                    .with_context(|| format!("Invalid configuration {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };
        if let Some(data_dir) = &args.data_dir {
            conf.data_dir = data_dir.clone();
        }
        Ok(conf)
    }
}

/// Discover, fetch, parse and store every resource of a portal
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Root listing page, defaults to the configured `portalRoot`
    pub portal_root: Option<String>,
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Override the user agent sent with every request
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Override the maximum number of requests in flight
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    /// Override the number of retries after a retryable failure
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Override the per-request timeout
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Override the minimum delay between requests to one host
    #[arg(long)]
    pub min_interval_ms: Option<u64>,
    /// Override the fetch error handling strategy
    #[arg(value_enum, long)]
    pub on_fetch_error: Option<OnError>,
    /// Override the parse error handling strategy
    #[arg(value_enum, long)]
    pub on_parse_error: Option<OnError>,
    /// Only report what would be fetched
    #[arg(long)]
    pub dry_run: bool,
    /// Print the run outcome as json
    #[arg(long)]
    pub json: bool,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

impl TryFrom<&RunArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let mut conf = PipelineConfig::try_from(&args.config)?;
        if let Some(portal_root) = &args.portal_root {
            conf.portal_root = Some(portal_root.clone());
        }
        if let Some(user_agent) = &args.user_agent {
            conf.fetch.user_agent = user_agent.clone();
        }
        if let Some(max_concurrency) = args.max_concurrency {
            conf.fetch.max_concurrency = max_concurrency;
        }
        if let Some(max_retries) = args.max_retries {
            conf.fetch.max_retries = max_retries;
        }
        if let Some(timeout_ms) = args.timeout_ms {
            conf.fetch.timeout_ms = timeout_ms;
        }
        if let Some(min_interval_ms) = args.min_interval_ms {
            conf.fetch.min_interval_ms = min_interval_ms;
        }
        if let Some(on_fetch_error) = args.on_fetch_error {
            conf.on_fetch_error = on_fetch_error;
        }
        if let Some(on_parse_error) = args.on_parse_error {
            conf.on_parse_error = on_parse_error;
        }
        if args.dry_run {
            conf.dry_run = true;
        }
        conf.validate()?;
        Ok(conf)
    }
}

/// Cancels `cancel` on the first Ctrl-C.
fn cancel_on_sigint(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, letting in-flight requests finish");
            cancel.cancel();
        }
    });
}

pub fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let conf = PipelineConfig::try_from(&args)?;
    let portal_root = conf
        .portal_root
        .clone()
        .context("No portal root given, pass one or set `portalRoot`")?;
    let pipeline = Pipeline::open(conf)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let outcome = rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_sigint(cancel.clone());
        pipeline.run(&portal_root, cancel).await
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let report = &outcome.report;
        println!("Run {}", outcome.state);
        println!(
            "discovered={} fetched={} skipped={} failed={} parsed={} stored={} warnings={}",
            report.discovered,
            report.fetched,
            report.skipped,
            report.failed,
            report.parsed,
            report.stored,
            report.warnings
        );
        for planned in &report.planned {
            println!("would fetch {}", planned.url);
        }
    }
    eprintln!("{} resources failed", outcome.report.failed);
    for failure in &outcome.report.failures {
        eprintln!("  {} [{}] {}", failure.url, failure.kind, failure.message);
    }

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Parse a single local page and print its records as json lines
#[derive(Debug, clap::Args)]
pub struct ParseArgs {
    /// A local html page holding a data table
    pub file: PathBuf,
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Url the page was served from, used to resolve links
    #[arg(long)]
    pub url: Option<String>,
}

pub fn parse(args: ParseArgs) -> anyhow::Result<ExitCode> {
    let conf = PipelineConfig::try_from(&args.config)?;
    let parser = RecordParser::new(conf.record)?;

    let bytes = read_file(&args.file)?;
    let source_url = match args.url {
        Some(url) => url,
        None => format!("file://{}", args.file.canonicalize()?.display()),
    };
    let batch = parser.parse(&RawPayload::new(bytes, source_url))?;

    for warning in &batch.warnings {
        log::warn!("Row {}: {}", warning.row, warning.reason);
    }
    print_records(batch.records)?;
    Ok(ExitCode::SUCCESS)
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Couldn't read {}", path.display()))
}

#[derive(Debug, clap::Args)]
pub struct SelectArgs {
    /// Only records whose id starts with this prefix
    #[arg(long)]
    pub id_prefix: Option<String>,
    /// Only records where FIELD renders as VALUE
    #[arg(long = "field", value_name = "FIELD=VALUE", value_parser = parse_field)]
    pub fields: Vec<(String, String)>,
    /// Fields grouping records, by source page when omitted
    #[arg(long)]
    pub group_by: Vec<String>,
    /// Keep only the records with the greatest value of this field per group
    #[arg(long)]
    pub latest_by: Option<String>,
    /// Field matched against `--prefer` suffixes
    #[arg(long, requires = "prefer")]
    pub prefer_field: Option<String>,
    /// Preferred value suffixes, most preferred first
    #[arg(long)]
    pub prefer: Vec<String>,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected FIELD=VALUE, got {raw:?}"))
}

impl SelectArgs {
    fn filter(&self) -> RecordFilter {
        RecordFilter {
            id_prefix: self.id_prefix.clone(),
            fields: self.fields.clone(),
            source: None,
        }
    }

    /// The configured reduction with the given flags taking precedence.
    fn reduction(&self, configured: &Reduction) -> Reduction {
        let mut reduction = configured.clone();
        if !self.group_by.is_empty() {
            reduction.group_by = self.group_by.clone();
        }
        if let Some(latest_by) = &self.latest_by {
            reduction.latest_by = Some(latest_by.clone());
        }
        if let Some(field) = &self.prefer_field {
            reduction.prefer = Some(Preference {
                field: field.clone(),
                suffixes: self.prefer.clone(),
            });
        }
        reduction
    }

    fn select(&self, pipeline: &Pipeline) -> Vec<Record> {
        let records = pipeline.records().list(&self.filter());
        self.reduction(&pipeline.config().reduction).apply(records)
    }
}

/// Print stored records as json lines
#[derive(Debug, clap::Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    #[command(flatten)]
    pub select: SelectArgs,
}

pub fn list(args: ListArgs) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::open(PipelineConfig::try_from(&args.config)?)?;
    print_records(args.select.select(&pipeline))?;
    Ok(ExitCode::SUCCESS)
}

/// Download the files linked by stored records into the content store
#[derive(Debug, clap::Args)]
pub struct MirrorArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    #[command(flatten)]
    pub select: SelectArgs,
    /// Print the mirror report as json
    #[arg(long)]
    pub json: bool,
}

pub fn mirror(args: MirrorArgs) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::open(PipelineConfig::try_from(&args.config)?)?;
    let records = args.select.select(&pipeline);
    log::info!("Mirroring {} records", records.len());

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_sigint(cancel.clone());
        pipeline.mirror(records, cancel).await
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for object in &report.objects {
            println!("{} {} {}", object.content_hash, object.record_id, object.url);
        }
        println!(
            "requested={} downloaded={} skipped={} failed={} without_link={}",
            report.requested, report.downloaded, report.skipped, report.failed, report.without_link
        );
    }
    for failure in &report.failures {
        eprintln!("  {} [{}] {}", failure.url, failure.kind, failure.message);
    }

    Ok(if report.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_records(records: impl IntoIterator<Item = Record>) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for record in records {
        serde_json::to_writer(&mut out, &record)?;
        writeln!(out)?;
    }
    Ok(())
}

fn init_logs(quiet: bool) {
    if !quiet {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("portal_crawler=info,portal=info"),
        )
        .init();
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Run(args) => {
            init_logs(args.quiet);
            run(args)
        }
        SubCommand::Parse(args) => {
            init_logs(false);
            parse(args)
        }
        SubCommand::List(args) => {
            init_logs(false);
            list(args)
        }
        SubCommand::Mirror(args) => {
            init_logs(false);
            mirror(args)
        }
        SubCommand::Completion { shell } => {
            generate(shell, &mut Args::command(), "portal", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}
