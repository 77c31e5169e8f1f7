//! autotest CLI - autonomous end-to-end testing via Chrome DevTools Protocol.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use autotest::browser::{Browser, BrowserLauncher, ChromeLauncher, LaunchOptions, SessionOptions};
use autotest::config::{default_base_dir, CrawlDepth, Credentials, LlmConfig};
use autotest::discovery::{CrawlOptions, WebsiteCrawler};
use autotest::llm::{LlmProvider, OllamaProvider};
use autotest::models::ApplicationMap;
use autotest::sink::{JsonlSink, ResultSink};
use autotest::{
    AutonomousTestingOrchestrator, Collaborators, MultiPanelConfig, MultiPanelOrchestrator,
    ProgressReporter, RunConfig,
};

#[derive(Parser)]
#[command(name = "autotest")]
#[command(about = "Autonomous end-to-end testing of web applications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print the result as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, authenticate, generate, execute, heal, analyze and report
    Run(RunArgs),

    /// Run public/user/admin panels and cross-check access control
    Panels {
        /// Multi-panel config file (JSON)
        #[arg(short, long)]
        config: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Discovery only: print the application map
    Crawl {
        url: String,

        #[arg(long, value_enum, default_value_t = CrawlDepth::Shallow)]
        depth: CrawlDepth,

        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Website to test
    #[arg(long)]
    url: Option<String>,

    /// API base URL to test
    #[arg(long)]
    api_url: Option<String>,

    /// Config file (JSON); flags override it
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long, value_enum)]
    depth: Option<CrawlDepth>,

    /// Username for the target application
    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Disable self-healing
    #[arg(long)]
    no_healing: bool,

    /// Record session video
    #[arg(long)]
    video: bool,

    /// Skip failure screenshots
    #[arg(long)]
    no_screenshots: bool,

    /// File tickets for confident application bugs
    #[arg(long)]
    tickets: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Parallel browser sessions
    #[arg(short, long)]
    workers: Option<usize>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Use the local LLM for flow generation and failure analysis
    #[arg(long)]
    ai: bool,

    /// Ollama model (implies --ai)
    #[arg(long)]
    model: Option<String>,

    /// Output directory (default ~/.autotest/runs)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Session id (default: generated)
    #[arg(long)]
    session: Option<String>,

    /// Append result events as JSON lines to this file
    #[arg(long)]
    events: Option<PathBuf>,
}

impl CommonArgs {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(workers) = self.workers {
            config.parallel_workers = workers;
        }
        if self.headed {
            config.headless = false;
        }
        if self.ai || self.model.is_some() {
            config.ai_analysis_enabled = true;
        }
        if let Some(model) = &self.model {
            let mut llm = config.llm.clone().unwrap_or_default();
            llm.model = model.clone();
            config.llm = Some(llm);
        }
        if let Some(output) = &self.output {
            config.output_dir = Some(output.clone());
        }
    }

    fn session_id(&self) -> String {
        self.session
            .clone()
            .unwrap_or_else(|| format!("run-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]))
    }

    fn collaborators(&self, config: &RunConfig) -> Result<Collaborators> {
        let mut collaborators = Collaborators::default();
        if config.ai_analysis_enabled {
            let llm_config = config.llm.clone().unwrap_or_else(LlmConfig::default);
            let provider = OllamaProvider::new(&llm_config).context("Failed to create LLM provider")?;
            collaborators.llm = Some(Arc::new(provider) as Arc<dyn LlmProvider>);
        }
        if let Some(path) = &self.events {
            collaborators.sink = Some(Arc::new(JsonlSink::new(path)) as Arc<dyn ResultSink>);
        }
        Ok(collaborators)
    }
}

fn run_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(url) = &args.url {
        config.website_url = Some(url.clone());
    }
    if let Some(api_url) = &args.api_url {
        config.api_url = Some(api_url.clone());
    }
    if let Some(depth) = args.depth {
        config.depth = depth;
    }
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        config.authentication = Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        });
    }
    if args.no_healing {
        config.enable_healing = false;
    }
    if args.video {
        config.capture_video = true;
    }
    if args.no_screenshots {
        config.capture_screenshots = false;
    }
    if args.tickets {
        config.create_jira_tickets = true;
    }
    args.common.apply(&mut config);
    Ok(config)
}

/// Render progress updates on stderr until the channel closes.
fn spawn_progress_printer(progress: &ProgressReporter) -> tokio::task::JoinHandle<()> {
    let mut rx = progress.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => eprintln!(
                    "[{:>3.0}%] {:?}: {}",
                    update.progress, update.phase, update.message
                ),
                Err(RecvError::Lagged(n)) => eprintln!("[....] {} progress updates skipped", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn cmd_run(args: RunArgs, json: bool) -> Result<()> {
    let config = run_config(&args)?;
    let session_id = args.common.session_id();
    let collaborators = args.common.collaborators(&config)?;

    let orchestrator = AutonomousTestingOrchestrator::new(Arc::new(ChromeLauncher))
        .with_collaborators(collaborators);
    let printer = spawn_progress_printer(orchestrator.progress());

    let outcome = orchestrator.run(&session_id, &config).await;
    drop(orchestrator);
    let _ = printer.await;
    let result = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.report.to_console());
        println!(
            "\nReport: {}",
            config.output_dir_for(&session_id).join("report.json").display()
        );
    }
    Ok(())
}

async fn cmd_panels(config_path: String, common: CommonArgs, json: bool) -> Result<()> {
    let mut config = MultiPanelConfig::from_file(&config_path)?;
    common.apply(&mut config.base);
    let session_id = common.session_id();
    let collaborators = common.collaborators(&config.base)?;

    let orchestrator = MultiPanelOrchestrator::new(
        AutonomousTestingOrchestrator::new(Arc::new(ChromeLauncher)).with_collaborators(collaborators),
    );
    let printer = spawn_progress_printer(orchestrator.progress());

    let outcome = orchestrator.run(&session_id, &config).await;
    drop(orchestrator);
    let _ = printer.await;
    let report = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.to_console());
    }
    Ok(())
}

async fn cmd_crawl(url: String, depth: CrawlDepth, headed: bool) -> Result<()> {
    let options = LaunchOptions {
        headless: !headed,
        user_data_dir: default_base_dir().join("crawl-profile"),
    };
    let browser = ChromeLauncher
        .launch(&options)
        .await
        .context("Failed to launch Chrome")?;
    let crawler = WebsiteCrawler::new(
        Arc::clone(&browser),
        SessionOptions::default(),
        CrawlOptions::from(depth),
    );
    let crawled = crawler.crawl(&url).await;
    if let Err(e) = browser.close().await {
        tracing::warn!("Closing browser failed: {}", e);
    }

    let map = ApplicationMap {
        website: Some(crawled?),
        api: None,
    };
    println!("{}", serde_json::to_string_pretty(&map)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "autotest=debug,chromiumoxide=warn"
    } else {
        "autotest=info,chromiumoxide=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let started = std::time::Instant::now();
    let outcome = match cli.command {
        Commands::Run(args) => cmd_run(args, cli.json).await,
        Commands::Panels { config, common } => cmd_panels(config, common, cli.json).await,
        Commands::Crawl { url, depth, headed } => cmd_crawl(url, depth, headed).await,
    };
    tracing::debug!("Finished in {:?}", started.elapsed());
    outcome
}
