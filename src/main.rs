use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic, Result};

use veritas_core::{
    Budget, CommentRef, OutputFormat, PullRequestId, Verdict, VerificationRun, VeritasConfig,
};
use veritas_review::controller::RefinementController;
use veritas_review::extract::extract_claims;
use veritas_review::github::GitHubClient;
use veritas_review::history::{HistoryEntry, SqliteHistory};
use veritas_review::llm::LlmClient;
use veritas_review::ports::{DiffSource, LanguageModel, ReviewHistory};
use veritas_review::publish::{render_review, Publisher};
use veritas_server::dispatch::Services;

const CONFIG_FILE: &str = ".veritas.toml";

#[derive(Parser)]
#[command(
    name = "veritas",
    version,
    about = "Verified AI pull-request review",
    long_about = "Veritas drafts a pull-request review with an LLM, then checks every finding\n\
                   against the repository at the head commit before anything is posted.\n\
                   Findings the code contradicts are rewritten or removed.\n\n\
                   Examples:\n  \
                     veritas serve                          Run the GitHub webhook service\n  \
                     veritas verify --pr owner/repo#12      Verify one pull request and print the result\n  \
                     veritas extract --file review.md       Show the claims found in a review\n  \
                     veritas history --limit 5              List recent runs\n  \
                     veritas init                           Write a default .veritas.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .veritas.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable summaries (default)\n  \
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  The review comment as it would be posted"
    )]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the GitHub webhook service
    #[command(long_about = "Start the GitHub webhook service.\n\n\
        Listens on [server] bind for pull_request deliveries and runs one verified\n\
        review per pull request at a time. Set [server] webhook_secret or\n\
        VERITAS_WEBHOOK_SECRET to authenticate deliveries.")]
    Serve {
        /// Listen address, overriding [server] bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Verify one pull request end to end
    #[command(long_about = "Verify one pull request end to end.\n\n\
        Drafts a review, validates every claim against the head commit and refines\n\
        the review until it converges. Prints the result; --post also writes it\n\
        to the pull request's review comment.\n\n\
        Examples:\n  veritas verify --pr octo/app#7\n  veritas verify --pr octo/app#7 --budget -1 --post")]
    Verify {
        /// Pull request to verify (format: owner/repo#123)
        #[arg(long)]
        pr: String,
        /// Verification calls allowed, -1 for unlimited (overrides config)
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
        /// Publish the result to the pull request
        #[arg(long)]
        post: bool,
    },
    /// Print the claims found in a review
    #[command(long_about = "Print the claims found in a review.\n\n\
        Reads review text from stdin or a file and shows the claims the\n\
        verification loop would check.\n\n\
        Examples:\n  veritas extract --file review.md\n  cat review.md | veritas extract --format json")]
    Extract {
        /// Read the review from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List recent verification runs
    History {
        /// Maximum runs to show (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Create a default .veritas.toml configuration file
    #[command(long_about = "Create a default .veritas.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .veritas.toml already exists.")]
    Init,
}

const DEFAULT_CONFIG: &str = r#"# Veritas Configuration

[llm]
# provider = "openai"
# model = "gpt-4o"
# base_url = "https://api.openai.com/v1"
# api_key = "..."            # or OPENAI_API_KEY
# max_retries = 3
# retry_base_ms = 500
# timeout_secs = 120

[github]
# token = "..."              # or GITHUB_TOKEN / GH_TOKEN
# api_base = "https://api.github.com"

[verification]
# Chargeable calls per run (file fetches and model checks); -1 = unlimited
# budget = 20
# max_iterations = 5
# max_file_bytes = 1048576
# snippet_lines = 80
# max_transport_failures = 3

[review]
# max_diff_chars = 16000
# max_files = 50
# skip_patterns = ["*.snap", "fixtures/**"]
# skip_extensions = ["svg"]

[server]
# bind = "0.0.0.0:8080"
# webhook_secret = "..."     # or VERITAS_WEBHOOK_SECRET
# bot_name = "Veritas"
# repositories = ["owner/repo"]   # empty = all
# branches = ["main"]             # empty = all

[history]
# path = ".veritas/history.db"

[log]
# level = "info"             # or VERITAS_LOG / RUST_LOG
# json = false
"#;

/// File, then environment, then flags.
fn load_config(cli: &Cli) -> Result<VeritasConfig> {
    let mut config = match &cli.config {
        Some(path) => VeritasConfig::from_file(path)
            .wrap_err(format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                VeritasConfig::from_file(default_path).wrap_err("loading .veritas.toml")?
            } else {
                VeritasConfig::default()
            }
        }
    };
    config.apply_env()?;

    if cli.verbose {
        config.log.level = "debug".into();
    }
    match &cli.command {
        Command::Verify {
            budget: Some(budget),
            ..
        } => config.verification.budget = *budget,
        Command::Serve { bind: Some(bind) } => config.server.bind = bind.clone(),
        _ => {}
    }
    config.validate()?;
    Ok(config)
}

fn read_input(file: &Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err(format!("reading {}", path.display())),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .into_diagnostic()
                .wrap_err("reading stdin")?;
            Ok(input)
        }
    }
}

fn llm_client(config: &VeritasConfig) -> Result<LlmClient> {
    if config.llm.provider == "openai" && config.llm.api_key.is_none() {
        miette::bail!(miette::miette!(
            help = "Set OPENAI_API_KEY or add api_key under [llm] in .veritas.toml",
            "No API key configured for LLM provider '{}'",
            config.llm.provider
        ));
    }
    Ok(LlmClient::new(&config.llm)?)
}

fn github_client(config: &VeritasConfig) -> Result<Arc<GitHubClient>> {
    Ok(Arc::new(GitHubClient::new(&config.github)?))
}

async fn serve(config: &VeritasConfig) -> Result<()> {
    let github = github_client(config)?;
    let history: Arc<dyn ReviewHistory> = Arc::new(SqliteHistory::open(&config.history.path)?);
    let services = Services {
        diffs: github.clone(),
        content: github.clone(),
        comments: github,
        model: Arc::new(llm_client(config)?),
        history: Some(history),
    };
    veritas_server::serve(config, services).await?;
    Ok(())
}

async fn verify(config: &VeritasConfig, pr: &str, post: bool) -> Result<VerificationRun> {
    let pr: PullRequestId = pr.parse()?;
    let github = github_client(config)?;
    let model = Arc::new(llm_client(config)?);
    let model_name = model.model().to_string();
    let controller = RefinementController::new(model, github.clone(), config);
    let publisher = Publisher::new(github.clone(), config.server.bot_name.clone());

    let snapshot = github.pull_request(&pr).await?;
    let comment = if post {
        publisher.open_placeholder(&pr, &snapshot.head_ref).await?
    } else {
        CommentRef(0)
    };

    let budget = Budget::from_setting(config.verification.budget)?;
    let run = VerificationRun::new(pr, snapshot.head_ref.clone(), comment, budget);
    let run = controller.run(run, &snapshot).await;

    if post {
        publisher.publish(&run).await?;
    }
    match SqliteHistory::open(&config.history.path)
        .and_then(|history| history.insert(&HistoryEntry::from_run(&run, &model_name)?))
    {
        Ok(()) => {}
        Err(e) => tracing::warn!(error = %e, "could not record review history"),
    }
    Ok(run)
}

fn print_run(run: &VerificationRun, format: OutputFormat, bot_name: &str) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(run).into_diagnostic()?);
        }
        OutputFormat::Markdown => print!("{}", render_review(run, bot_name)),
        OutputFormat::Text => {
            println!(
                "{}: {} after {} refinement pass(es), {} verification call(s)",
                run.pr,
                run.status,
                run.iteration,
                run.budget.spent()
            );
            if let Some(failure) = &run.failure {
                println!("Failure: {failure}");
            }
            println!(
                "Claims: {} confirmed, {} unverifiable, {} refuted in total\n",
                run.count(Verdict::Confirmed),
                run.count(Verdict::Unverifiable),
                run.claims
                    .iter()
                    .filter(|c| c.verdict == Verdict::Refuted)
                    .count()
            );
            for claim in &run.claims {
                println!(
                    "  [{}] {} ({})",
                    claim.verdict,
                    claim.assertion,
                    claim.evidence.as_deref().unwrap_or("no evidence")
                );
            }
            if let Some(text) = &run.final_text {
                println!("\n{}", text.trim_end());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .expect("miette handler");
    human_panic::setup_panic!();

    let cli = Cli::parse();

    if let Command::Init = cli.command {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            miette::bail!(".veritas.toml already exists");
        }
        std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
        println!("Created .veritas.toml with default configuration");
        return Ok(());
    }

    let config = load_config(&cli)?;
    veritas_core::telemetry::init_tracing(config.log.json, &config.log.level);

    match cli.command {
        Command::Serve { .. } => serve(&config).await?,
        Command::Verify { ref pr, post, .. } => {
            let run = verify(&config, pr, post).await?;
            print_run(&run, cli.format, &config.server.bot_name)?;
        }
        Command::Extract { ref file } => {
            let review = read_input(file)?;
            let claims = extract_claims(&review);
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&claims).into_diagnostic()?);
                }
                OutputFormat::Markdown => {
                    println!("| # | Kind | Location | Assertion |");
                    println!("|---|------|----------|-----------|");
                    for claim in &claims {
                        println!(
                            "| {} | {} | {} | {} |",
                            claim.id,
                            claim.kind,
                            claim.location().unwrap_or_default(),
                            claim.assertion.replace('|', "\\|")
                        );
                    }
                }
                OutputFormat::Text => {
                    if claims.is_empty() {
                        println!("No claims found.");
                    }
                    for claim in &claims {
                        let subject = claim
                            .subject
                            .as_ref()
                            .map(|s| format!(" subject=`{}`", s.symbol))
                            .unwrap_or_default();
                        println!(
                            "{:>3}. [{}] {}{}\n     {}",
                            claim.id,
                            claim.kind,
                            claim.location().unwrap_or_else(|| "(no file)".into()),
                            subject,
                            claim.assertion
                        );
                    }
                }
            }
        }
        Command::History { limit } => {
            let history = SqliteHistory::open(&config.history.path)?;
            let entries = history.recent(limit)?;
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&entries).into_diagnostic()?);
                }
                OutputFormat::Markdown => {
                    println!("| When | Pull request | Status | Passes | Calls | Confirmed | Unverifiable | Removed |");
                    println!("|------|--------------|--------|--------|-------|-----------|--------------|---------|");
                    for e in &entries {
                        println!(
                            "| {} | {}#{} | {} | {} | {} | {} | {} | {} |",
                            e.created_at.format("%Y-%m-%d %H:%M"),
                            e.repo,
                            e.pr_number,
                            e.status,
                            e.iterations,
                            e.calls_spent,
                            e.confirmed,
                            e.unverifiable,
                            e.refuted
                        );
                    }
                }
                OutputFormat::Text => {
                    if entries.is_empty() {
                        println!("No runs recorded in {}", config.history.path.display());
                    }
                    for e in &entries {
                        println!(
                            "{}  {}#{}  {:<15} passes={} calls={} confirmed={} unverifiable={} removed={}",
                            e.created_at.format("%Y-%m-%d %H:%M"),
                            e.repo,
                            e.pr_number,
                            e.status,
                            e.iterations,
                            e.calls_spent,
                            e.confirmed,
                            e.unverifiable,
                            e.refuted
                        );
                    }
                }
            }
        }
        Command::Init => unreachable!("handled before configuration is loaded"),
    }

    Ok(())
}
