use std::io::{self, BufRead, BufReader, IsTerminal};
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use pm_tools::audit;
use pm_tools::cite::{self, CiteHttpClient};
use pm_tools::diff::{self, load_jsonl};
use pm_tools::download::{
    self, ArticleIds, PdfHttpClient, SourceClient, SourceKind, find_pdf_sources,
};
use pm_tools::error::PmError;
use pm_tools::eutils::EutilsHttpClient;
use pm_tools::fetch;
use pm_tools::filter::{self, Criteria, read_jsonl};
use pm_tools::search::{self, DEFAULT_MAX};
use pm_tools::store::{self, Store};

#[derive(Parser)]
#[command(name = "pm")]
#[command(about = "Composable PubMed CLI pipeline with a project-local cache and audit trail")]
#[command(version, author)]
struct Cli {
    /// Show progress on stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize audit trail and cache (.pm/) in the current directory")]
    Init,
    #[command(about = "Search PubMed, print PMIDs one per line")]
    Search(SearchArgs),
    #[command(about = "Fetch PubMed XML for PMIDs read from stdin")]
    Fetch(FetchArgs),
    #[command(about = "Fetch CSL-JSON citations, one JSON object per line")]
    Cite(CiteArgs),
    #[command(about = "Download full-text PDFs from PMC and Unpaywall")]
    Download(DownloadArgs),
    #[command(about = "Filter JSONL articles from stdin by field patterns")]
    Filter(FilterArgs),
    #[command(about = "Compare two JSONL files by PMID")]
    Diff(DiffArgs),
    #[command(about = "View the audit trail")]
    Audit(AuditArgs),
}

#[derive(Args)]
struct SearchArgs {
    /// PubMed query (quote multi-word queries)
    query: String,

    /// Maximum results to return
    #[arg(long, default_value_t = DEFAULT_MAX)]
    max: usize,

    /// Bypass the cache and re-fetch from PubMed
    #[arg(long)]
    refresh: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    refresh: bool,
}

#[derive(Args)]
struct CiteArgs {
    /// PMIDs; read from stdin when omitted
    pmids: Vec<String>,

    #[arg(long)]
    refresh: bool,
}

#[derive(Args)]
struct DownloadArgs {
    /// Read PMIDs or JSONL from a file instead of stdin
    #[arg(long)]
    input: Option<Utf8PathBuf>,

    #[arg(long, default_value = ".")]
    output_dir: Utf8PathBuf,

    #[arg(long)]
    overwrite: bool,

    /// Resolve sources and report, without downloading
    #[arg(long)]
    dry_run: bool,

    /// Download timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Contact email for the Unpaywall API
    #[arg(long)]
    email: Option<String>,

    /// Only use PMC (skip Unpaywall)
    #[arg(long)]
    pmc_only: bool,

    /// Only use Unpaywall (skip PMC)
    #[arg(long)]
    unpaywall_only: bool,
}

#[derive(Args)]
struct FilterArgs {
    /// Year filter: 2024, 2020-2024, 2020-, or -2024
    #[arg(long)]
    year: Option<String>,

    /// Journal contains (case-insensitive)
    #[arg(long)]
    journal: Option<String>,

    /// Journal equals exactly
    #[arg(long)]
    journal_exact: Option<String>,

    /// Any author contains (case-insensitive)
    #[arg(long)]
    author: Option<String>,

    /// Title contains (case-insensitive)
    #[arg(long)]
    title: Option<String>,

    /// PMID equals, or is in a comma-separated set
    #[arg(long)]
    pmid: Option<String>,

    #[arg(long)]
    min_authors: Option<usize>,

    #[arg(long)]
    has_abstract: bool,

    #[arg(long)]
    has_doi: bool,
}

#[derive(Args)]
struct DiffArgs {
    /// Baseline JSONL file, or - for stdin
    old_file: String,

    /// Comparison JSONL file, or - for stdin
    new_file: String,

    /// Suppress output, just set the exit code
    #[arg(short, long)]
    quiet: bool,

    /// Fields to ignore when comparing (comma-separated)
    #[arg(long, value_delimiter = ',')]
    ignore: Vec<String>,
}

#[derive(Args)]
struct AuditArgs {
    /// List search operations with dates and counts
    #[arg(long)]
    searches: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "pm_tools=info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    match run(cli) {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(pm) = report.downcast_ref::<PmError>() {
                return ExitCode::from(map_exit_code(pm));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &PmError) -> u8 {
    match error {
        PmError::InputNotFound(_) => 2,
        _ => 1,
    }
}

fn run(cli: Cli) -> miette::Result<ExitCode> {
    match cli.command {
        Commands::Init => run_init(),
        Commands::Search(args) => run_search(args),
        Commands::Fetch(args) => run_fetch(args),
        Commands::Cite(args) => run_cite(args),
        Commands::Download(args) => run_download(args),
        Commands::Filter(args) => run_filter(args),
        Commands::Diff(args) => run_diff(args),
        Commands::Audit(args) => run_audit(args),
    }
}

fn run_init() -> miette::Result<ExitCode> {
    let cwd = std::env::current_dir().into_diagnostic()?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| miette::Report::msg(format!("non-UTF-8 working directory: {path:?}")))?;
    store::init(&cwd).into_diagnostic()?;
    println!("Initialized .pm/ in {cwd}");
    println!("Audit trail: .pm/audit.jsonl");
    println!("Cache: .pm/cache/");
    Ok(ExitCode::SUCCESS)
}

fn run_search(args: SearchArgs) -> miette::Result<ExitCode> {
    let store = Store::detect();
    let client = EutilsHttpClient::new().into_diagnostic()?;
    let outcome =
        search::search(&client, &args.query, args.max, &store, args.refresh).into_diagnostic()?;

    if let Some(ts) = &outcome.original_ts {
        // the envelope came off disk; its timestamp is arbitrary content
        let date = ts.get(..10).unwrap_or(ts);
        eprintln!("pm: using cached search from {date}. Use --refresh to update.");
    }
    for pmid in &outcome.pmids {
        println!("{pmid}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_fetch(args: FetchArgs) -> miette::Result<ExitCode> {
    let pmids = read_stdin_lines()?;
    if pmids.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    let store = Store::detect();
    let client = EutilsHttpClient::new().into_diagnostic()?;
    let document =
        fetch::fetch_document(&client, &pmids, &store, args.refresh).into_diagnostic()?;
    if !document.is_empty() {
        print!("{document}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_cite(args: CiteArgs) -> miette::Result<ExitCode> {
    let pmids = if args.pmids.is_empty() {
        read_stdin_lines()?
    } else {
        args.pmids
    };
    if pmids.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    let store = Store::detect();
    let client = CiteHttpClient::new().into_diagnostic()?;
    let outcome = cite::cite(&client, &pmids, &store, args.refresh).into_diagnostic()?;
    for citation in &outcome.citations {
        println!("{}", serde_json::to_string(citation).into_diagnostic()?);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_download(args: DownloadArgs) -> miette::Result<ExitCode> {
    let lines = match &args.input {
        Some(path) => {
            let file = std::fs::File::open(path.as_std_path())
                .map_err(|_| PmError::InputNotFound(path.to_string()))
                .into_diagnostic()?;
            read_lines(BufReader::new(file))?
        }
        None => read_stdin_lines()?,
    };
    if lines.is_empty() {
        eprintln!("Error: No input provided. Use --help for usage.");
        return Ok(ExitCode::from(1));
    }

    let client = PdfHttpClient::new(Duration::from_secs(args.timeout)).into_diagnostic()?;
    let email = args.email.as_deref();
    let articles = collect_article_ids(&client, &lines, email)?;
    let sources = find_pdf_sources(
        &client,
        &articles,
        email,
        args.pmc_only,
        args.unpaywall_only,
    );

    if args.dry_run {
        let available = sources.iter().filter(|s| s.url.is_some()).count();
        for source in &sources {
            match source.kind {
                Some(SourceKind::Pmc) => println!("PMID {}: PDF available via pmc", source.pmid),
                Some(SourceKind::Unpaywall) => {
                    println!("PMID {}: PDF available via unpaywall", source.pmid);
                }
                None => println!("PMID {}: No source available", source.pmid),
            }
        }
        println!(
            "\nSummary: {available} available, {} not available",
            sources.len() - available
        );
        return Ok(if available > 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(2)
        });
    }

    let store = Store::detect();
    let report = download::download_pdfs(
        &client,
        &sources,
        &args.output_dir,
        args.overwrite,
        store.root(),
    )
    .into_diagnostic()?;

    eprintln!(
        "Downloaded: {}, Skipped: {}, Failed: {}",
        report.downloaded, report.skipped, report.failed
    );

    if report.downloaded == 0 && report.skipped == 0 {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

/// Download input is either JSONL article records (from `pm filter` or
/// similar) or bare PMIDs, which go through the ID Converter to pick up
/// PMCIDs and DOIs.
fn collect_article_ids(
    client: &dyn SourceClient,
    lines: &[String],
    email: Option<&str>,
) -> miette::Result<Vec<ArticleIds>> {
    if lines[0].starts_with('{') {
        let mut articles = Vec::new();
        for line in lines {
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            articles.push(ArticleIds {
                pmid: json_string(&value, "pmid"),
                pmcid: json_string(&value, "pmcid"),
                doi: json_string(&value, "doi"),
            });
        }
        return Ok(articles);
    }

    let pmids: Vec<String> = lines.to_vec();
    let converted = client
        .convert_pmids(&pmids, email.unwrap_or("user@example.com"))
        .into_diagnostic()?;
    Ok(pmids
        .iter()
        .map(|pmid| {
            converted
                .iter()
                .find(|record| &record.pmid == pmid)
                .cloned()
                .unwrap_or_else(|| ArticleIds {
                    pmid: pmid.clone(),
                    ..ArticleIds::default()
                })
        })
        .collect())
}

fn json_string(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn run_filter(args: FilterArgs) -> miette::Result<ExitCode> {
    let criteria = Criteria {
        year: args.year,
        journal: args.journal,
        journal_exact: args.journal_exact,
        author: args.author,
        title: args.title,
        pmid: args.pmid,
        min_authors: args.min_authors,
        has_abstract: args.has_abstract,
        has_doi: args.has_doi,
    };

    let articles = read_jsonl(io::stdin().lock()).into_diagnostic()?;
    let store = Store::detect();
    let kept =
        filter::filter_articles_audited(articles, &criteria, store.root()).into_diagnostic()?;
    for article in &kept {
        println!("{}", serde_json::to_string(article).into_diagnostic()?);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_diff(args: DiffArgs) -> miette::Result<ExitCode> {
    if args.old_file == "-" && args.new_file == "-" {
        eprintln!("Error: Cannot use stdin (-) for both files");
        return Ok(ExitCode::from(2));
    }

    let old_articles = load_diff_input(&args.old_file)?;
    let new_articles = load_diff_input(&args.new_file)?;
    let ignore: Vec<String> = args
        .ignore
        .iter()
        .map(|field| field.trim().to_string())
        .filter(|field| !field.is_empty())
        .collect();

    let records = diff::diff_jsonl(&old_articles, &new_articles, &ignore);
    if !args.quiet {
        for record in &records {
            println!("{}", serde_json::to_string(&record.entry).into_diagnostic()?);
        }
    }
    Ok(if records.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn load_diff_input(path: &str) -> miette::Result<Vec<Value>> {
    if path == "-" {
        let articles = read_jsonl(io::stdin().lock()).into_diagnostic()?;
        Ok(articles
            .into_iter()
            .filter(|value| value.is_object() && value.get("pmid").is_some())
            .collect())
    } else {
        load_jsonl(Utf8PathBuf::from(path).as_path()).into_diagnostic()
    }
}

fn run_audit(args: AuditArgs) -> miette::Result<ExitCode> {
    let Some(root) = store::find_root() else {
        return Err(PmError::RootNotFound.into());
    };

    if args.searches {
        println!("{}", audit::format_searches(&audit::searches(&root)));
    } else {
        println!("{}", audit::format_summary(&audit::summary(&root)));
    }
    Ok(ExitCode::SUCCESS)
}

fn read_stdin_lines() -> miette::Result<Vec<String>> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(Vec::new());
    }
    read_lines(stdin.lock())
}

fn read_lines(reader: impl BufRead) -> miette::Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.into_diagnostic()?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}
