use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use codeloom::analysis::{scan_workspace, DependencyAnalyzer, IgnoreList, ProjectAnalysis};
use codeloom::classify::RequestClassifier;
use codeloom::config::Config;
use codeloom::engine::{AgentEvent, Engine};
use codeloom::llm::{HttpModelClient, ModelClient};
use codeloom::logging;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "codeloom",
    about = "Run model conversations with coherent tool calls over a live workspace",
    version
)]
struct Cli {
    /// Verbose logging (CODELOOM_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a message through a script (or a synthesized conversation)
    Run(RunArgs),
    /// Show how a request would be classified
    Classify(ClassifyArgs),
    /// Scan the workspace and build the dependency matrix
    Analyze(AnalyzeArgs),
    /// Print the dependency blueprint
    Blueprint(BlueprintArgs),
    /// Store API keys in the system keychain
    SetKeys(SetKeysArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Message text, or `-` to read it from stdin
    message: String,
    /// Script file to run the message through
    #[arg(short, long)]
    script: Option<PathBuf>,
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
    /// Model id (overrides config)
    #[arg(short, long)]
    model: Option<String>,
    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    message: String,
    /// Ask the model when the rules are unsure
    #[arg(long)]
    model_fallback: bool,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
    /// Write .codeloom/project_analysis.json
    #[arg(long)]
    save: bool,
}

#[derive(Args, Debug)]
struct BlueprintArgs {
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
    /// Seed from the saved snapshot instead of scanning
    #[arg(long)]
    from_snapshot: bool,
}

#[derive(Args, Debug)]
struct SetKeysArgs {
    /// One or more keys; several keys rotate when one is rate limited
    #[arg(required = true)]
    keys: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = Config::load();

    match cli.command {
        Commands::Run(args) => run(args, config).await,
        Commands::Classify(args) => classify(args, config).await,
        Commands::Analyze(args) => analyze(args),
        Commands::Blueprint(args) => blueprint(args),
        Commands::SetKeys(args) => set_keys(args, config),
    }
}

fn workspace_root(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("Workspace not found: {}", path.display()))
}

fn read_message(raw: String) -> Result<String> {
    if raw != "-" {
        return Ok(raw);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read message from stdin")?;
    Ok(buf.trim().to_string())
}

async fn run(args: RunArgs, mut config: Config) -> Result<()> {
    let root = workspace_root(&args.workspace)?;
    let message = read_message(args.message)?;
    if let Some(model) = args.model {
        config.provider.model = model;
    }

    let client: Arc<dyn ModelClient> = Arc::new(HttpModelClient::from_config(&config)?);
    let analyzer = Arc::new(DependencyAnalyzer::new());
    match ProjectAnalysis::load(&root) {
        Ok(Some(snapshot)) => snapshot.seed(&root, &analyzer),
        Ok(None) => {}
        Err(err) => tracing::warn!("Ignoring unreadable project snapshot: {}", err),
    }

    let classifier = RequestClassifier::new(config.classifier.clone()).with_model(client.clone());
    let engine = Engine::new(&root, client)
        .with_config(&config)
        .with_classifier(classifier)
        .with_analyzer(analyzer);

    let mut stream = engine.send_message(message, args.script);
    let cancel = stream.cancellation_token();
    tokio::spawn(cancel_on_ctrl_c(cancel));

    let mut failed = false;
    while let Some(event) = stream.next().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        failed |= matches!(event, AgentEvent::Error { .. });
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nCancelling...");
        cancel.cancel();
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Chunk { text } => println!("{}", text),
        AgentEvent::ToolCall { name, args, .. } => eprintln!("→ {} {}", name, args),
        AgentEvent::Progress { message } => eprintln!("  {}", message),
        AgentEvent::ToolResult { name, result, .. } => {
            let mark = if result.is_error() { "✗" } else { "✓" };
            eprintln!("{} {}: {}", mark, name, first_line(&result.display_text));
        }
        AgentEvent::Done { .. } => {}
        AgentEvent::Error {
            kind,
            message,
            hint,
            retry_after,
        } => {
            eprintln!("Error ({}): {}", kind, message);
            if let Some(hint) = hint {
                eprintln!("  {}", hint);
            }
            if let Some(wait) = retry_after {
                eprintln!("  Try again in {}s.", wait.as_secs().max(1));
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

async fn classify(args: ClassifyArgs, config: Config) -> Result<()> {
    let mut classifier = RequestClassifier::new(config.classifier.clone());
    if args.model_fallback {
        let client: Arc<dyn ModelClient> = Arc::new(HttpModelClient::from_config(&config)?);
        classifier = classifier.with_model(client);
    }
    let classification = classifier
        .classify(&args.message, &CancellationToken::new())
        .await;
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

fn analyze(args: AnalyzeArgs) -> Result<()> {
    let root = workspace_root(&args.workspace)?;
    let analyzer = DependencyAnalyzer::new();
    let scan = scan_workspace(&root, &IgnoreList::load(&root), &analyzer);
    let snapshot = ProjectAnalysis::from_scan(&root, &scan);
    let matrix = analyzer.matrix(&root);
    let edges: usize = matrix.dependencies.values().map(|deps| deps.len()).sum();

    println!("Project type: {}", snapshot.project_type);
    println!(
        "Files: {} ({} analyzed, {} dependency edges)",
        scan.structure.len(),
        scan.metadata.len(),
        edges
    );
    if !snapshot.dependencies.is_empty() {
        println!("Dependencies: {}", snapshot.dependencies.join(", "));
    }
    if args.save {
        let path = snapshot.save(&root)?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn blueprint(args: BlueprintArgs) -> Result<()> {
    let root = workspace_root(&args.workspace)?;
    let analyzer = DependencyAnalyzer::new();
    if args.from_snapshot {
        let snapshot = ProjectAnalysis::load(&root)?
            .context("No saved snapshot. Run `codeloom analyze --save` first.")?;
        snapshot.seed(&root, &analyzer);
    } else {
        scan_workspace(&root, &IgnoreList::load(&root), &analyzer);
    }
    print!("{}", analyzer.generate_blueprint(&root));
    Ok(())
}

fn set_keys(args: SetKeysArgs, mut config: Config) -> Result<()> {
    config
        .set_api_keys(&args.keys)
        .map_err(anyhow::Error::msg)?;
    println!(
        "Stored {} key{}.",
        args.keys.len(),
        if args.keys.len() == 1 { "" } else { "s" }
    );
    Ok(())
}
