use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use wikibot_core::batch::{BatchEditOrchestrator, BatchReport, Transform};
use wikibot_core::category::CategoryMembers;
use wikibot_core::config::{BotConfig, DEFAULT_CONFIG_FILE, load_config};
use wikibot_core::session::{Credentials, WikiSession};
use wikibot_core::sparql::SparqlPager;
use wikibot_core::transforms::{AddCategory, AppendMarker, RegexReplace, RemoveCategory};
use wikibot_core::transport::ReqwestTransport;
use wikibot_core::wikibase::statement_iri_to_guid;

#[derive(Debug, Parser)]
#[command(
    name = "wikibot",
    version,
    about = "Batch maintenance bot for MediaWiki and Wikibase sites"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: wikibot.toml)")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Report what would change without writing")]
    dry_run: bool,
    #[arg(long, global = true, value_name = "URL", help = "Override the wiki API URL")]
    api_url: Option<String>,
    #[arg(long, global = true, help = "Print the run report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List the members of a category")]
    Members(MembersArgs),
    #[command(about = "Append a marker to every member that lacks it")]
    Tag(TagArgs),
    #[command(about = "Add or remove a category on every member")]
    Categorize(CategorizeArgs),
    #[command(about = "Regex search and replace across every member")]
    Replace(ReplaceArgs),
    #[command(
        name = "remove-claims",
        about = "Remove statements found by a SPARQL query"
    )]
    RemoveClaims(RemoveClaimsArgs),
    Move(MoveArgs),
    Delete(DeleteArgs),
    Undelete(UndeleteArgs),
    #[command(about = "Upload an XML dump through Special:Import")]
    Import(ImportArgs),
}

#[derive(Debug, Args)]
struct MembersArgs {
    category: String,
    #[arg(long = "namespace", value_name = "ID", help = "Namespace filter (repeatable)")]
    namespaces: Vec<i32>,
}

#[derive(Debug, Args)]
struct BatchArgs {
    category: String,
    #[arg(long = "namespace", value_name = "ID", help = "Namespace filter (repeatable)")]
    namespaces: Vec<i32>,
    #[arg(long, help = "Edit summary")]
    summary: Option<String>,
    #[arg(long, value_name = "N", help = "Stop after N pages")]
    limit: Option<usize>,
    #[arg(long, help = "Re-read and retry once after an edit conflict")]
    retry_conflicts: bool,
}

#[derive(Debug, Args)]
struct TagArgs {
    #[command(flatten)]
    batch: BatchArgs,
    #[arg(long, help = "Text to append, e.g. {{Stub}}")]
    marker: String,
    #[arg(long, value_name = "REGEX", help = "Pattern that means the marker is already there")]
    present: Option<String>,
}

#[derive(Debug, Args)]
#[command(group(clap::ArgGroup::new("change").required(true).args(["add", "remove"])))]
struct CategorizeArgs {
    #[command(flatten)]
    batch: BatchArgs,
    #[arg(long, value_name = "NAME")]
    add: Option<String>,
    #[arg(long, value_name = "NAME")]
    remove: Option<String>,
}

#[derive(Debug, Args)]
struct ReplaceArgs {
    #[command(flatten)]
    batch: BatchArgs,
    #[arg(long, value_name = "REGEX")]
    pattern: String,
    #[arg(long, value_name = "TEXT", help = "Replacement; $1 and ${name} expand captures")]
    replacement: String,
}

#[derive(Debug, Args)]
struct RemoveClaimsArgs {
    #[arg(long, value_name = "PATH", help = "SPARQL query without LIMIT/OFFSET")]
    query_file: PathBuf,
    #[arg(long)]
    summary: String,
    #[arg(long, default_value_t = 5000)]
    page_size: usize,
    #[arg(long, default_value = "statement", help = "Variable bound to statement IRIs")]
    variable: String,
}

#[derive(Debug, Args)]
struct MoveArgs {
    from: String,
    to: String,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    no_redirect: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    title: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
struct UndeleteArgs {
    title: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
struct ImportArgs {
    file: PathBuf,
    #[arg(long, value_name = "PREFIX")]
    interwiki_prefix: String,
    #[arg(long)]
    full_history: bool,
}

#[derive(Debug, Clone, Copy)]
struct OutputOptions {
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let output = OutputOptions { json: cli.json };

    match cli.command {
        Commands::Members(args) => run_members(&config, output, args),
        Commands::Tag(args) => {
            let mut transform = match &args.present {
                Some(pattern) => AppendMarker::with_presence_pattern(args.marker.clone(), pattern)?,
                None => AppendMarker::new(args.marker.clone())?,
            };
            run_batch(&config, output, &args.batch, &mut transform)
        }
        Commands::Categorize(args) => match (&args.add, &args.remove) {
            (Some(name), None) => {
                run_batch(&config, output, &args.batch, &mut AddCategory::new(name))
            }
            (None, Some(name)) => {
                run_batch(&config, output, &args.batch, &mut RemoveCategory::new(name))
            }
            _ => bail!("categorize takes exactly one of --add or --remove"),
        },
        Commands::Replace(args) => {
            let mut transform = RegexReplace::new(&args.pattern, args.replacement.clone())?;
            run_batch(&config, output, &args.batch, &mut transform)
        }
        Commands::RemoveClaims(args) => run_remove_claims(&config, output, args),
        Commands::Move(args) => run_move(&config, args),
        Commands::Delete(args) => run_delete(&config, args),
        Commands::Undelete(args) => run_undelete(&config, args),
        Commands::Import(args) => run_import(&config, args),
    }
}

fn resolve_config(cli: &Cli) -> Result<BotConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = load_config(&path)?;
    config.apply_env_overrides()?;
    if let Some(api_url) = &cli.api_url {
        config.wiki.api_url = Some(api_url.clone());
    }
    if cli.dry_run {
        config.run.dry_run = Some(true);
    }
    Ok(config)
}

fn is_dry_run(config: &BotConfig) -> bool {
    config.run.dry_run.unwrap_or(false)
}

fn open_session(config: &BotConfig, login: bool) -> Result<WikiSession<ReqwestTransport>> {
    let mut client_config = config.client_config()?;
    if login {
        client_config.assert = Some("user".to_string());
    }
    let transport = ReqwestTransport::new(&config.user_agent(), config.timeout())?;
    let mut session = WikiSession::connect(client_config, transport);
    if login {
        let credentials = Credentials::from_env()?;
        session.login(&credentials)?;
    }
    Ok(session)
}

fn run_members(config: &BotConfig, output: OutputOptions, args: MembersArgs) -> Result<()> {
    let mut session = open_session(config, false)?;
    let mut titles = Vec::new();
    for member in session.category_members(&args.category, &args.namespaces) {
        titles.push(member?.title);
    }
    if output.json {
        println!("{}", serde_json::to_string_pretty(&titles)?);
        return Ok(());
    }
    println!("category: {}", args.category);
    println!("members: {}", titles.len());
    for title in titles {
        println!("  - {title}");
    }
    Ok(())
}

fn run_batch(
    config: &BotConfig,
    output: OutputOptions,
    args: &BatchArgs,
    transform: &mut dyn Transform,
) -> Result<()> {
    let mut policy = config.run_policy()?;
    if let Some(summary) = &args.summary {
        policy.summary = summary.clone();
    }
    policy.max_items = args.limit;
    policy.retry_conflicts |= args.retry_conflicts;

    let mut session = open_session(config, !policy.dry_run)?;
    let mut source = CategoryMembers::new(&args.category, &args.namespaces);
    info!(category = %source.category(), dry_run = policy.dry_run, "starting batch");
    let report = BatchEditOrchestrator::new(policy).run(&mut session, &mut source, transform)?;
    print_report(output, &report)?;

    if let Some(reason) = &report.aborted {
        bail!("batch ended early: {reason}");
    }
    if !report.skipped_error.is_empty() {
        bail!(
            "{} of {} pages failed",
            report.skipped_error.len(),
            report.processed
        );
    }
    Ok(())
}

fn print_report(output: OutputOptions, report: &BatchReport) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        for line in report.summary_lines() {
            println!("{line}");
        }
    }
    Ok(())
}

fn run_remove_claims(config: &BotConfig, output: OutputOptions, args: RemoveClaimsArgs) -> Result<()> {
    let query = fs::read_to_string(&args.query_file)
        .with_context(|| format!("failed to read {}", args.query_file.display()))?;
    let dry_run = is_dry_run(config);
    let mut session = open_session(config, !dry_run)?;

    let rows = SparqlPager::new(config.sparql_endpoint(), query, args.page_size)
        .collect_all(&mut session)?;
    let mut guids = Vec::with_capacity(rows.len());
    let mut unparsable = 0usize;
    for row in &rows {
        let Some(binding) = row.get(&args.variable) else {
            continue;
        };
        match statement_iri_to_guid(&binding.value) {
            Ok(guid) => guids.push(guid),
            Err(error) => {
                warn!("skipping row: {error}");
                unparsable += 1;
            }
        }
    }
    guids.sort();
    guids.dedup();
    info!(rows = rows.len(), statements = guids.len(), "query finished");

    if dry_run {
        if output.json {
            println!("{}", serde_json::to_string_pretty(&guids)?);
            return Ok(());
        }
        println!("dry_run: true");
        println!("statements: {}", guids.len());
        println!("unparsable: {unparsable}");
        for guid in &guids {
            println!("  - {guid}");
        }
        return Ok(());
    }

    let report = session.remove_claims(&guids, &args.summary)?;
    if output.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("statements: {}", guids.len());
        println!("unparsable: {unparsable}");
        println!("removed: {}", report.removed.len());
        println!("failed: {}", report.failed.len());
        for (guid, reason) in &report.failed {
            println!("  - {guid}: {reason}");
        }
    }
    if !report.failed.is_empty() {
        bail!("{} statements could not be removed", report.failed.len());
    }
    Ok(())
}

fn run_move(config: &BotConfig, args: MoveArgs) -> Result<()> {
    println!("from: {}", args.from);
    println!("to: {}", args.to);
    println!("no_redirect: {}", args.no_redirect);
    if is_dry_run(config) {
        println!("dry_run: true");
        return Ok(());
    }
    let mut session = open_session(config, true)?;
    session.move_page(&args.from, &args.to, &args.reason, args.no_redirect)?;
    println!("moved: true");
    Ok(())
}

fn run_delete(config: &BotConfig, args: DeleteArgs) -> Result<()> {
    println!("title: {}", args.title);
    if is_dry_run(config) {
        println!("dry_run: true");
        return Ok(());
    }
    let mut session = open_session(config, true)?;
    let deleted = session.delete_page(&args.title, &args.reason)?;
    println!("deleted: {deleted}");
    if !deleted {
        println!("detail: page did not exist");
    }
    Ok(())
}

fn run_undelete(config: &BotConfig, args: UndeleteArgs) -> Result<()> {
    println!("title: {}", args.title);
    if is_dry_run(config) {
        println!("dry_run: true");
        return Ok(());
    }
    let mut session = open_session(config, true)?;
    session.undelete_page(&args.title, &args.reason)?;
    println!("undeleted: true");
    Ok(())
}

fn run_import(config: &BotConfig, args: ImportArgs) -> Result<()> {
    let xml = fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let filename = file_name(&args.file);
    println!("file: {}", args.file.display());
    println!("bytes: {}", xml.len());
    println!("interwiki_prefix: {}", args.interwiki_prefix);
    if is_dry_run(config) {
        println!("dry_run: true");
        return Ok(());
    }
    let mut session = open_session(config, true)?;
    let imported = session.import_xml(xml, &filename, &args.interwiki_prefix, args.full_history)?;
    println!("imported_pages: {imported}");
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "import.xml".to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn batch_commands_parse_shared_arguments() {
        let cli = Cli::try_parse_from([
            "wikibot",
            "--dry-run",
            "tag",
            "Shinto shrines",
            "--marker",
            "{{Shrine stub}}",
            "--namespace",
            "0",
            "--namespace",
            "14",
            "--limit",
            "10",
        ])
        .expect("parse");
        assert!(cli.dry_run);
        let Commands::Tag(args) = cli.command else {
            panic!("expected tag");
        };
        assert_eq!(args.batch.category, "Shinto shrines");
        assert_eq!(args.batch.namespaces, vec![0, 14]);
        assert_eq!(args.batch.limit, Some(10));
        assert_eq!(args.marker, "{{Shrine stub}}");
    }

    #[test]
    fn categorize_requires_a_direction() {
        assert!(Cli::try_parse_from(["wikibot", "categorize", "Kami"]).is_err());
        assert!(
            Cli::try_parse_from(["wikibot", "categorize", "Kami", "--add", "A", "--remove", "B"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["wikibot", "categorize", "Kami", "--add", "Deities"]).is_ok());
    }

    #[test]
    fn remove_claims_defaults() {
        let cli = Cli::try_parse_from([
            "wikibot",
            "remove-claims",
            "--query-file",
            "q.rq",
            "--summary",
            "cleanup",
        ])
        .expect("parse");
        let Commands::RemoveClaims(args) = cli.command else {
            panic!("expected remove-claims");
        };
        assert_eq!(args.page_size, 5000);
        assert_eq!(args.variable, "statement");
    }
}
