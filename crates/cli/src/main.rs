use clap::{Parser, Subcommand};
use lib::agents::AgentConfig;
use lib::chat::{ChatEvent, ChatService, SendOutcome};
use lib::prompts::PromptLibrary;
use lib::session::Role;
use lib::store::{FileStore, KeyValueStore};
use lib::title::{TitleGenerator, TitleSummarizer};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "zenava")]
#[command(about = "Zenava chat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config file and the data directory.
    Init {
        /// Config file path (default: ZENAVA_CONFIG_PATH or ~/.zenava/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat interactively. Ctrl-C stops a streaming reply; /exit quits.
    Chat {
        /// Config file path (default: ZENAVA_CONFIG_PATH or ~/.zenava/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Optional existing session id to continue.
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// List, rename or delete saved sessions.
    Sessions {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Manage Dify agent configurations.
    Agents {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Manage saved system prompts.
    Prompts {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: PromptsAction,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    List,
    Rename { id: String, title: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum AgentsAction {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        access_key_id: String,
        #[arg(long)]
        access_key_secret: String,
        #[arg(long)]
        agent_id: String,
    },
    Remove { id: String },
}

#[derive(Subcommand)]
enum PromptsAction {
    List,
    /// Save a prompt; with --id, update that prompt instead of adding one.
    Save {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long, value_name = "ID")]
        id: Option<String>,
    },
    Delete { id: String },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("zenava {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Chat { config, session }) => run_chat(config, session).await,
        Some(Commands::Sessions { config, action }) => run_sessions(config, action).await,
        Some(Commands::Agents { config, action }) => run_agents(config, action).await,
        Some(Commands::Prompts { config, action }) => run_prompts(config, action),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let data_dir = lib::config::init_config_dir(&path)?;
    println!("initialized configuration at {}", path.display());
    println!("data directory: {}", data_dir.display());
    Ok(())
}

fn open_store(config_path: Option<PathBuf>) -> anyhow::Result<(lib::config::Config, Arc<dyn KeyValueStore>)> {
    let (config, path) = lib::config::load_config(config_path)?;
    let data_dir = lib::config::resolve_data_dir(&config, &path);
    log::debug!("data directory {}", data_dir.display());
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(data_dir));
    Ok((config, store))
}

fn open_service(config_path: Option<PathBuf>) -> anyhow::Result<(Arc<ChatService>, Arc<dyn KeyValueStore>)> {
    let (config, store) = open_store(config_path)?;
    let user_id = lib::device::load_or_create_user_id(store.as_ref())?;
    let backend = lib::llm::backend_from_config(&config);
    let summarizer = lib::config::resolve_gemini_api_key(&config).map(|_| {
        Arc::new(lib::llm::gemini_from_config(&config)) as Arc<dyn TitleSummarizer>
    });
    let titles = TitleGenerator::from_config(&config, summarizer);
    let service = ChatService::new(Arc::clone(&store), backend, titles, user_id)
        .with_system_instruction(lib::config::resolve_system_instruction(&config));
    Ok((Arc::new(service), store))
}

async fn run_sessions(config_path: Option<PathBuf>, action: SessionsAction) -> anyhow::Result<()> {
    let (service, _) = open_service(config_path)?;
    match action {
        SessionsAction::List => print_sessions(&service).await,
        SessionsAction::Rename { id, title } => {
            if !service.rename_session(&id, &title).await {
                anyhow::bail!("no session {} (or blank title)", id);
            }
            println!("renamed {}", id);
        }
        SessionsAction::Delete { id } => {
            if !service.delete_session(&id).await {
                anyhow::bail!("no session {}", id);
            }
            println!("deleted {}", id);
        }
    }
    Ok(())
}

async fn print_sessions(service: &ChatService) {
    let active = service.active_session_id().await;
    for s in service.sessions().await {
        let marker = if active.as_deref() == Some(s.id.as_str()) { "*" } else { " " };
        let count = s.messages.iter().filter(|m| !m.exclude_from_history).count();
        println!("{} {}  {}  ({} messages)", marker, s.id, s.title, count);
    }
}

async fn run_agents(config_path: Option<PathBuf>, action: AgentsAction) -> anyhow::Result<()> {
    let (service, _) = open_service(config_path)?;
    match action {
        AgentsAction::List => {
            let agents = service.agents().await;
            if agents.is_empty() {
                println!("no agents configured; add one with `zenava agents add`");
            }
            for a in agents {
                println!("{}  {}  (agent {})", a.id, a.display_name, a.agent_id);
            }
        }
        AgentsAction::Add {
            name,
            access_key_id,
            access_key_secret,
            agent_id,
        } => {
            let agent = AgentConfig::new(name, access_key_id, access_key_secret, agent_id);
            let id = agent.id.clone();
            service.upsert_agent(agent).await?;
            println!("added agent {}", id);
        }
        AgentsAction::Remove { id } => {
            let removed = service.remove_agent(&id).await?;
            println!("removed agent {} ({})", removed.id, removed.display_name);
        }
    }
    Ok(())
}

fn run_prompts(config_path: Option<PathBuf>, action: PromptsAction) -> anyhow::Result<()> {
    let (_, store) = open_store(config_path)?;
    let mut library = PromptLibrary::load(store.as_ref());
    match action {
        PromptsAction::List => {
            for p in library.all() {
                println!("{}  {}", p.id, p.title);
            }
        }
        PromptsAction::Save { title, content, id } => {
            let Some(saved) = library.save(id.as_deref(), &title, &content) else {
                anyhow::bail!("prompt title must not be blank");
            };
            library.save_to(store.as_ref())?;
            println!("saved prompt {}", saved);
        }
        PromptsAction::Delete { id } => {
            if library.remove(&id).is_none() {
                anyhow::bail!("no prompt {}", id);
            }
            library.save_to(store.as_ref())?;
            println!("deleted prompt {}", id);
        }
    }
    Ok(())
}

async fn run_chat(config_path: Option<PathBuf>, session: Option<String>) -> anyhow::Result<()> {
    let (service, store) = open_service(config_path)?;
    let mut current = match session {
        Some(id) => {
            if !service.select_session(&id).await {
                anyhow::bail!("no session {}", id);
            }
            id
        }
        None => service
            .active_session_id()
            .await
            .ok_or_else(|| anyhow::anyhow!("no active session"))?,
    };
    print_transcript(&service, &current).await;

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let (command, arg) = match input.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (input, ""),
        };

        match command {
            "/exit" | "/quit" => break,
            "/new" => {
                let s = service.create_session(None).await;
                current = s.id;
                print_transcript(&service, &current).await;
            }
            "/sessions" => print_sessions(&service).await,
            "/switch" => {
                if service.select_session(arg).await {
                    current = arg.to_string();
                    print_transcript(&service, &current).await;
                } else {
                    eprintln!("no session {}", arg);
                }
            }
            "/title" => {
                if !service.rename_session(&current, arg).await {
                    eprintln!("usage: /title <new title>");
                }
            }
            "/regen" => {
                let last_reply = service.session(&current).await.and_then(|s| {
                    s.messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::Assistant && !m.exclude_from_history)
                        .map(|m| m.id.clone())
                });
                let Some(message_id) = last_reply else {
                    eprintln!("nothing to regenerate");
                    continue;
                };
                let task = {
                    let service = Arc::clone(&service);
                    let id = current.clone();
                    tokio::spawn(async move { service.regenerate(&id, &message_id).await })
                };
                drive_turn(&service, &current, task).await?;
            }
            "/agent" => {
                if service.set_session_agent(&current, arg).await {
                    println!("session now uses {}", arg);
                } else {
                    eprintln!("usage: /agent <agent id or model name>");
                }
            }
            "/prompt" => {
                let library = PromptLibrary::load(store.as_ref());
                match library.get(arg) {
                    Some(p) => {
                        service.set_system_instruction(Some(p.content.clone())).await;
                        println!("system instruction set to \"{}\"", p.title);
                    }
                    None => eprintln!("no prompt {}", arg),
                }
            }
            _ => {
                let task = {
                    let service = Arc::clone(&service);
                    let id = current.clone();
                    let text = input.to_string();
                    tokio::spawn(async move { service.send_message(&id, &text).await })
                };
                drive_turn(&service, &current, task).await?;
            }
        }
    }

    Ok(())
}

async fn print_transcript(service: &ChatService, session_id: &str) {
    let Some(s) = service.session(session_id).await else {
        return;
    };
    println!("== {} ({})", s.title, s.id);
    for m in &s.messages {
        match m.role {
            Role::User => println!("> {}", m.text),
            Role::Assistant => println!("< {}", m.text),
        }
    }
}

/// Print fragments of the running turn as they arrive until it ends. Ctrl-C stops generation.
async fn drive_turn(
    service: &ChatService,
    session_id: &str,
    mut task: JoinHandle<SendOutcome>,
) -> anyhow::Result<()> {
    let mut events = service.subscribe();
    let mut started = false;
    let outcome = loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                if let Ok(ChatEvent::Fragment { session_id: sid, text, .. }) = event {
                    if sid == session_id {
                        if !started {
                            print!("< ");
                            started = true;
                        }
                        print!("{}", text);
                        io::stdout().flush()?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if !service.stop_generation(session_id).await {
                    eprintln!("\n(this backend cannot be stopped; waiting for the reply)");
                }
            }
            outcome = &mut task => break outcome?,
        }
    };
    if started {
        println!();
    }

    match outcome {
        SendOutcome::Completed { .. } => {}
        SendOutcome::Cancelled { .. } => println!("[stopped]"),
        SendOutcome::Failed { error, .. } => eprintln!("< 错误: {}", error),
        SendOutcome::ConfigurationMissing => {
            eprintln!("no agent or model configured for this session");
            eprintln!("add a Dify agent with `zenava agents add` and select it with /agent <id>,");
            eprintln!("or set backend.geminiApiKey in the config");
        }
        SendOutcome::Rejected(reason) => eprintln!("not sent: {:?}", reason),
    }
    Ok(())
}
