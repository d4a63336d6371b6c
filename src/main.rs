use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chatweave::app::App;
use chatweave::channel::ChannelAdapter;
use chatweave::channel::cloud::CloudChannel;
use chatweave::channel::console::ConsoleChannel;
use chatweave::config::{ConfigManager, EnvConfigManager};
use chatweave::engine::{EngineConfig, FlowEngine};
use chatweave::flow::FlowDefinition;
use chatweave::flow::store::InMemoryFlowStore;
use chatweave::leads::InMemoryLeadStore;
use chatweave::logger::init_tracing;
use chatweave::schema::write_schema;
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "chatweave",
    about = "Conversational flow automation runtime",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the runtime: load flows, watch the flow directory, start the
    /// scheduler.
    Run(RunArgs),

    /// Emit JSON schemas for flow files and payloads.
    Schema(SchemaArgs),

    /// Work with flow definition files.
    Flow(FlowArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Directory of flow definition files (.json / .yaml).
    #[arg(long, default_value = "./flows")]
    flows_dir: PathBuf,

    /// Optional JSON file of lead records.
    #[arg(long)]
    leads_file: Option<PathBuf>,

    /// .env file with channel credentials.
    #[arg(long, default_value = "./.env")]
    env_file: PathBuf,

    /// Log level override (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files; console-only when omitted.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "./schemas")]
    out_dir: PathBuf,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Parse and validate a flow file.
    Validate { file: PathBuf },
    /// Run a flow interactively against stdin, without registering it.
    Test { file: PathBuf },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        flows_dir: PathBuf::from("./flows"),
        leads_file: None,
        env_file: PathBuf::from("./.env"),
        log_level: "info".to_string(),
        log_dir: None,
    })) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let _guard = init_tracing("warn", None)?;
            write_schema(args.out_dir.clone())?;
            println!("Schemas written to {}", args.out_dir.display());
            Ok(())
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                let _guard = init_tracing("warn", None)?;
                let flow = FlowDefinition::load_from_file(&file)?;
                println!("✅ Flow `{}` is valid ({} nodes).", flow.name, flow.nodes.len());
                Ok(())
            }
            FlowCommands::Test { file } => test_flow(file).await,
        },
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let _guard = init_tracing(&args.log_level, args.log_dir.clone())?;
    info!("chatweave runtime starting up…");

    let config = ConfigManager(EnvConfigManager::new(Some(args.env_file.clone())));
    let channel = Arc::new(CloudChannel::new(config));

    let app = App::bootstrap(
        args.flows_dir.clone(),
        args.leads_file.clone(),
        channel,
        EngineConfig::default(),
    )
    .await?;

    println!("chatweave runtime running; press Ctrl-C to exit");
    info!("chatweave runtime running; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    app.shutdown().await;
    println!("Goodbye!");
    Ok(())
}

/// Interactive dry run: the flow is registered as a temporary definition
/// (auto-expiring, no stats) and driven from stdin, with every outbound
/// payload printed to the console.
async fn test_flow(file: PathBuf) -> Result<()> {
    let _guard = init_tracing("warn", None)?;

    let mut flow = FlowDefinition::load_from_file(&file)?;
    flow.id = format!("temp-{}", uuid::Uuid::new_v4());

    let channel = Arc::new(ConsoleChannel);
    let engine = FlowEngine::new(
        InMemoryFlowStore::new(),
        InMemoryLeadStore::new(),
        channel.clone(),
    );
    engine.register_temp_flow(flow.clone()).await;

    let identity = "test-user";
    println!("Testing flow `{}`. Type replies, or `exit` to quit.", flow.name);

    if let Some(payload) = engine.start_flow(identity, &flow).await? {
        channel.send(identity, &payload).await.ok();
    }

    let stdin = std::io::stdin();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }
        match engine.on_inbound_message(identity, line).await? {
            Some(payload) => {
                channel.send(identity, &payload).await.ok();
            }
            None => {
                println!("(flow ended)");
                break;
            }
        }
    }
    Ok(())
}
