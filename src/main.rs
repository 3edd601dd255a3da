//! pvt - see, decide, act
//!
//! ```bash
//! pvt schema
//! pvt analyze tasks.txt
//! pvt decide --goal "Open Start Menu" --image desktop.png
//! pvt seed common_ui.json
//! pvt run --task "Open Notepad" --image desktop.png --dry-run
//! pvt watch --live
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use pvt::cli::{
    print_banner, print_chat, print_decision, print_error, print_info, print_report, print_state, print_status,
    print_success, print_warning,
};
use pvt::core::{ConfigManager, ModelProvider, PvtConfig};
use pvt::input::{local_injector, DryRunInjector, InputInjector};
use pvt::logging;
use pvt::memory::{QdrantMemory, VectorMemory};
use pvt::providers::{Embedder, LanguageModel, OllamaClient, OpenAiCompatible};
use pvt::vision::{live_capture, FileCapture, ScreenCapture, TesseractOcr, TextRecognizer};
use pvt::vla::action::describe_schema;
use pvt::vla::knowledge::parse_seed_file;
use pvt::vla::{ground, parse_strict_str, DecisionEngine, KnowledgeGate, LoopController, PerceptualState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "pvt")]
#[command(author = "G-Tech SD")]
#[command(version)]
#[command(about = "See, decide, act: a guarded screen-control loop")]
#[command(long_about = r#"
pvt reads the screen through OCR, asks a language model for exactly one
action (CLICK, TYPE, WAIT, ABORT or NOOP), checks that the target is really
on screen, and only then moves the mouse or types.

Examples:
  pvt decide --goal "Open Start Menu" --image desktop.png
  pvt run --task "Open Notepad" --live --dry-run
  pvt learn --goal "Open Start Menu" --image desktop.png --action '{"type":"CLICK","target":"Start"}'
"#)]
struct Args {
    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: <config dir>/pvt/config.toml)
    #[arg(long, global = true, env = "PVT_CONFIG")]
    config: Option<PathBuf>,

    /// Model provider
    #[arg(long, global = true, value_parser = ["ollama", "openai"])]
    provider: Option<String>,

    /// Model endpoint URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Model name
    #[arg(long, global = true)]
    model: Option<String>,

    /// API key for OpenAI-compatible endpoints
    #[arg(long, global = true, env = "PVT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Vector memory URL
    #[arg(long, global = true)]
    memory_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the action schema the model must follow
    Schema,

    /// Score how well memory already knows a list of tasks
    Analyze {
        /// Task file, one task per line ("-" for stdin)
        input: String,
    },

    /// Decide one action for a goal and show where it would land
    Decide {
        #[arg(long)]
        goal: String,
        #[command(flatten)]
        source: ScreenSource,
    },

    /// Teach memory which action achieves a goal on a screen
    Learn {
        #[arg(long)]
        goal: String,
        /// Action JSON, e.g. {"type":"CLICK","target":"Start"}
        #[arg(long)]
        action: String,
        #[command(flatten)]
        source: ScreenSource,
    },

    /// Load a JSON file of UI scenarios into memory
    Seed {
        /// JSON list of {description, prerequisites, actions: [{goal, action, fact}]}
        file: PathBuf,
    },

    /// Show what memory would replay for a goal on a screen
    Recall {
        #[arg(long)]
        goal: String,
        #[command(flatten)]
        source: ScreenSource,
    },

    /// Run the active cycle until the task aborts or Ctrl+C
    Run {
        /// Task text; the first line is the goal
        #[arg(long)]
        task: String,
        #[command(flatten)]
        source: ScreenSource,
        /// Record input instead of sending it
        #[arg(long)]
        dry_run: bool,
    },

    /// Passive mode: watch while idle and answer questions on stdin
    Watch {
        #[command(flatten)]
        source: ScreenSource,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct ScreenSource {
    /// Screenshot to read instead of the live screen
    #[arg(long, conflicts_with = "live")]
    image: Option<PathBuf>,

    /// Capture the live screen (requires the `vision` feature)
    #[arg(long)]
    live: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Print the config file path
    Path,
    /// Write the current configuration (with overrides) to disk
    Init,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.debug, args.json);

    if let Err(e) = run(args).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let manager = match &args.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };
    let mut config = manager.load();
    apply_overrides(&mut config, &args);
    config.validate()?;

    match args.command {
        Commands::Schema => {
            println!("{}", describe_schema());
            Ok(())
        }
        Commands::Analyze { input } => analyze(&config, &input).await,
        Commands::Decide { goal, source } => decide(&config, &goal, &source).await,
        Commands::Learn { goal, action, source } => learn(&config, &goal, &action, &source).await,
        Commands::Seed { file } => seed(&config, &file).await,
        Commands::Recall { goal, source } => recall(&config, &goal, &source).await,
        Commands::Run { task, source, dry_run } => run_active(config, &task, &source, dry_run).await,
        Commands::Watch { source } => watch(config, &source).await,
        Commands::Config { action } => handle_config(&manager, &config, action),
    }
}

fn apply_overrides(config: &mut PvtConfig, args: &Args) {
    if let Some(provider) = args.provider.as_deref() {
        config.model.provider = match provider {
            "openai" => ModelProvider::OpenAi,
            _ => ModelProvider::Ollama,
        };
    }
    if let Some(endpoint) = &args.endpoint {
        config.model.endpoint = endpoint.clone();
    }
    if let Some(model) = &args.model {
        config.model.model = model.clone();
    }
    if let Some(key) = &args.api_key {
        config.model.api_key = Some(key.clone());
    }
    if let Some(url) = &args.memory_url {
        config.memory.url = url.clone();
    }
}

fn handle_config(manager: &ConfigManager, config: &PvtConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Path => {
            println!("{}", manager.path().display());
        }
        ConfigAction::Init => {
            manager
                .save(config)
                .with_context(|| format!("writing {}", manager.path().display()))?;
            print_success(&format!("Saved {}", manager.path().display()));
        }
    }
    Ok(())
}

// ========== Wiring ==========

fn build_model(config: &PvtConfig) -> Arc<dyn LanguageModel> {
    let settings = &config.model;
    match settings.provider {
        ModelProvider::Ollama => Arc::new(OllamaClient::new(&settings.endpoint, &settings.model)),
        ModelProvider::OpenAi => {
            let client = OpenAiCompatible::new(&settings.endpoint, &settings.model);
            match &settings.api_key {
                Some(key) => Arc::new(client.with_api_key(key)),
                None => Arc::new(client),
            }
        }
    }
}

fn build_knowledge(config: &PvtConfig, model: Arc<dyn LanguageModel>) -> Arc<KnowledgeGate> {
    let embedder: Arc<dyn Embedder> = Arc::new(
        OllamaClient::new(&config.model.embed_endpoint, &config.model.model)
            .with_embed_model(&config.model.embed_model),
    );

    let qdrant = QdrantMemory::new(&config.memory.url, &config.memory.collection, config.memory.vector_size);
    let memory: Arc<dyn VectorMemory> = match &config.memory.api_key {
        Some(key) => Arc::new(qdrant.with_api_key(key)),
        None => Arc::new(qdrant),
    };

    Arc::new(KnowledgeGate::new(model, embedder, memory, config.knowledge_config()))
}

fn build_capture(source: &ScreenSource) -> Result<Arc<dyn ScreenCapture>> {
    match (&source.image, source.live) {
        (Some(path), _) => Ok(Arc::new(FileCapture::new(path))),
        (None, true) => Ok(Arc::from(live_capture())),
        (None, false) => bail!("pass --image <file> or --live"),
    }
}

async fn read_screen(source: &ScreenSource) -> Result<PerceptualState> {
    let capture = build_capture(source)?;
    let image = capture.capture().await?;
    let page = TesseractOcr::default().recognize(&image).await?;
    Ok(page.into_state()?)
}

// ========== Commands ==========

async fn analyze(config: &PvtConfig, input: &str) -> Result<()> {
    let text = if input == "-" {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut text = String::new();
        while let Some(line) = lines.next_line().await? {
            text.push_str(&line);
            text.push('\n');
        }
        text
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("reading {}", input))?
    };

    let gate = build_knowledge(config, build_model(config));
    let report = gate.analyze_text(&text).await;
    if report.tasks.is_empty() {
        print_warning("No tasks found");
        return Ok(());
    }
    print_report(&report);
    Ok(())
}

async fn decide(config: &PvtConfig, goal: &str, source: &ScreenSource) -> Result<()> {
    let state = read_screen(source).await?;
    print_state(&state);

    let engine = DecisionEngine::with_config(build_model(config), config.decision_config());
    let result = engine.decide_next(goal, &state, &[]).await?;
    if result.was_retried {
        print_warning("First answer was invalid; repaired on retry");
    }
    tracing::debug!(raw = %result.raw_model_output, "model output");

    print_decision(&ground(&result.action, &state, result.rationale.as_deref()));
    Ok(())
}

async fn learn(config: &PvtConfig, goal: &str, action: &str, source: &ScreenSource) -> Result<()> {
    let action = parse_strict_str(action).context("invalid --action")?;
    let state = read_screen(source).await?;

    let gate = build_knowledge(config, build_model(config));
    gate.record_learned(goal, &action, &state.describe(10)).await?;
    print_success(&format!("Learned: {} -> {}", goal, action.summary()));
    Ok(())
}

async fn seed(config: &PvtConfig, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let scenarios = parse_seed_file(&text).with_context(|| format!("parsing {}", file.display()))?;

    let gate = build_knowledge(config, build_model(config));
    let report = gate.seed(&scenarios).await;
    if report.invalid > 0 {
        print_warning(&format!("{} entries had invalid actions", report.invalid));
    }
    if report.failed > 0 {
        print_error(&format!("{} entries could not be stored", report.failed));
    }
    print_success(&format!("Seeded {} entries from {} scenarios", report.seeded, scenarios.len()));
    if report.seeded == 0 && report.failed > 0 {
        bail!("memory unreachable at {}", config.memory.url);
    }
    Ok(())
}

async fn recall(config: &PvtConfig, goal: &str, source: &ScreenSource) -> Result<()> {
    let state = read_screen(source).await?;
    print_state(&state);

    let gate = build_knowledge(config, build_model(config));
    match gate.recall(goal, &state).await {
        Some(recalled) => {
            print_info(&format!("Remembered with similarity {:.2}", recalled.score));
            let why = format!("Remembered: {}", recalled.action.summary());
            print_decision(&ground(&recalled.action, &state, Some(&why)));
        }
        None => print_warning(&format!(
            "Nothing remembered above {:.2} for this goal",
            config.memory.recall_threshold
        )),
    }
    Ok(())
}

fn build_controller(
    config: PvtConfig,
    source: &ScreenSource,
    input: Arc<dyn InputInjector>,
) -> Result<Arc<LoopController>> {
    let model = build_model(&config);
    let engine = DecisionEngine::with_config(Arc::clone(&model), config.decision_config());
    let knowledge = build_knowledge(&config, Arc::clone(&model));

    let mut loop_config = config.loop_config();
    loop_config.live_capture |= source.live;

    let controller = LoopController::new(loop_config, engine, model, input)
        .with_capture(build_capture(source)?, Arc::new(TesseractOcr::default()))
        .with_knowledge(knowledge);
    Ok(Arc::new(controller))
}

async fn run_active(config: PvtConfig, task: &str, source: &ScreenSource, dry_run: bool) -> Result<()> {
    print_banner();
    let input: Arc<dyn InputInjector> = if dry_run {
        Arc::new(DryRunInjector::new())
    } else {
        Arc::from(local_injector())
    };
    print_info(&format!("Input: {}", input.name()));

    let controller = build_controller(config, source, input)?;
    controller.set_task(task);

    match controller.analyze_task_text(task).await {
        Ok(report) if !report.tasks.is_empty() => print_report(&report),
        Ok(_) => {}
        Err(e) => print_warning(&format!("Knowledge check skipped: {}", e)),
    }

    controller.start_active();
    let mut seen = (0, 0);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_warning("Stopping...");
                controller.stop_active();
                break;
            }
            _ = ticker.tick() => {
                drain(&controller, &mut seen);
                if !controller.is_active() && !controller.is_cycle_running() {
                    break;
                }
            }
        }
    }

    // Let an in-flight cycle finish before exiting
    while controller.is_cycle_running() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    drain(&controller, &mut seen);
    print_info(&format!("{} action(s) dispatched", controller.dispatch_count()));
    Ok(())
}

async fn watch(config: PvtConfig, source: &ScreenSource) -> Result<()> {
    print_banner();
    let controller = build_controller(config, source, Arc::new(DryRunInjector::new()))?;
    let timer = controller.spawn_idle_timer();
    print_info("Watching. Type a reply and press Enter; Ctrl+C to quit.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut seen = (0, 0);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => controller.send_reply(&line),
                Some(_) => controller.note_user_activity(),
                None => break,
            },
            _ = ticker.tick() => drain(&controller, &mut seen),
        }
    }

    timer.abort();
    println!("{}", style("bye").dim());
    Ok(())
}

/// Print status lines and chat messages not shown yet
fn drain(controller: &LoopController, seen: &mut (usize, usize)) {
    let (status, total) = controller.status_since(seen.0);
    status.iter().for_each(print_status);
    seen.0 = total;

    let (chat, total) = controller.chat_since(seen.1);
    chat.iter().for_each(print_chat);
    seen.1 = total;
}
