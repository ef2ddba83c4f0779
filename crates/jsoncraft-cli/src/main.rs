use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jsoncraft_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use jsoncraft_contracts::messages::{ChatMessage, Role};
use jsoncraft_contracts::persistence::KvStore;
use jsoncraft_contracts::visual::{VisualEntry, VisualStore};
use jsoncraft_engine::{load_attachment, ChatEngine, ClientConfig, SendOutcome};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "jsoncraft-rs", version, about = "JSONCraft structured prompt chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Send(SendArgs),
    Gallery(GalleryArgs),
    Export(ExportArgs),
    Import(ImportArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    client: Option<String>,
}

#[derive(Debug, Parser)]
struct SendArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    client: Option<String>,
}

#[derive(Debug, Parser)]
struct GalleryArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    query: Option<String>,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct ImportArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    file: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("jsoncraft-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Send(args) => run_send(args),
        Command::Gallery(args) => run_gallery(args),
        Command::Export(args) => run_export(args),
        Command::Import(args) => run_import(args),
    }
}

fn build_config(model: Option<String>, client: Option<String>) -> ClientConfig {
    let mut config = ClientConfig::from_env();
    if let Some(model) = model {
        config.model = model;
    }
    if let Some(client) = client {
        config.client = client;
    }
    config
}

fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("jsoncraft.json")
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let mut engine = ChatEngine::open(&args.data, build_config(args.model, args.client))?;

    println!(
        "JSONCraft chat started (model {}, client {}). Type /help for commands.",
        engine.model(),
        engine.client_name()
    );
    if let Some(session) = engine.current_session() {
        for message in &session.messages {
            print_message(message);
        }
    }

    let stdin = io::stdin();
    let mut line = String::new();
    let mut pending_attachment: Option<String> = None;

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join("  "));
            }
            "send" => {
                let prompt = intent.prompt.clone().unwrap_or_default();
                match engine.send_message(&prompt, pending_attachment.take()) {
                    Ok(outcome) => print_send_outcome(&engine, outcome),
                    Err(err) => println!("{err:#}"),
                }
            }
            "attach_image" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/attach requires a path");
                    continue;
                };
                match load_attachment(Path::new(&path)) {
                    Ok(data_url) => {
                        println!("Attached {path} ({} bytes encoded)", data_url.len());
                        pending_attachment = Some(data_url);
                    }
                    Err(err) => println!("Could not attach {path}: {err:#}"),
                }
            }
            "detach_image" => {
                pending_attachment = None;
                println!("Attachment cleared");
            }
            "set_template" => {
                let name = value_as_non_empty_string(intent.command_args.get("name"));
                match name.as_deref() {
                    None => match engine.templates().active_template() {
                        Some(template) => println!("Active template: {}", template.name),
                        None => println!("No active template"),
                    },
                    Some("none") => {
                        engine.templates_mut().set_active(None);
                        println!("Template cleared");
                    }
                    Some(name) => match resolve_template_id(&engine, name) {
                        Some(id) => {
                            engine.templates_mut().set_active(Some(id.as_str()));
                            println!("Template set to {name}");
                        }
                        None => println!("No template named '{name}'"),
                    },
                }
            }
            "list_templates" => {
                for template in engine.templates().templates() {
                    let marker = if engine
                        .templates()
                        .active_template()
                        .map(|active| active.id == template.id)
                        .unwrap_or(false)
                    {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {}  {}  [{}]",
                        template.id,
                        template.name,
                        template.tags.join(", ")
                    );
                }
            }
            "retry_message" => {
                let id = value_as_non_empty_string(intent.command_args.get("id"))
                    .or_else(|| last_user_message_id(&engine));
                let Some(id) = id else {
                    println!("Nothing to retry yet");
                    continue;
                };
                match engine.retry_message(&id) {
                    Ok(outcome) => print_send_outcome(&engine, outcome),
                    Err(err) => println!("{err:#}"),
                }
            }
            "search_gallery" => {
                let query =
                    value_as_non_empty_string(intent.command_args.get("query")).unwrap_or_default();
                let entries = engine.visuals().search(&query);
                if entries.is_empty() {
                    println!("No gallery entries");
                }
                for entry in entries {
                    print_entry(&entry);
                }
            }
            "start_session" => match engine.start_session() {
                Ok(id) => println!("Started session {id}"),
                Err(err) => println!("{err:#}"),
            },
            "list_sessions" => {
                for (id, record) in engine.sessions() {
                    let marker = if Some(id.as_str()) == engine.current_session_id() {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {id}  {}  ({} messages, updated {})",
                        record.meta.title,
                        record.messages.len(),
                        record.meta.updated_at
                    );
                }
            }
            "switch_session" => {
                let Some(id) = value_as_non_empty_string(intent.command_args.get("id")) else {
                    println!("/session requires an id");
                    continue;
                };
                match engine.switch_session(&id) {
                    Ok(()) => {
                        println!("Switched to session {id}");
                        if let Some(session) = engine.current_session() {
                            for message in &session.messages {
                                print_message(message);
                            }
                        }
                    }
                    Err(err) => println!("{err:#}"),
                }
            }
            "delete_session" => {
                let Some(id) = value_as_non_empty_string(intent.command_args.get("id")) else {
                    println!("/delete requires an id");
                    continue;
                };
                match engine.delete_session(&id) {
                    Ok(()) => println!("Deleted session {id}"),
                    Err(err) => println!("{err:#}"),
                }
            }
            "clear_chat" => {
                let Some(id) = engine.current_session_id().map(str::to_string) else {
                    println!("No active session");
                    continue;
                };
                match engine.clear_chat(&id) {
                    Ok(()) => println!("Chat cleared"),
                    Err(err) => println!("{err:#}"),
                }
            }
            "stop_assistant" => {
                engine.stop_assistant();
                println!("Stopped");
            }
            "export_data" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/export requires a path");
                    continue;
                };
                let snapshot = engine.export_data();
                let written = serde_json::to_string_pretty(&snapshot)
                    .map_err(anyhow::Error::from)
                    .and_then(|text| {
                        fs::write(&path, text).with_context(|| format!("failed writing {path}"))
                    });
                match written {
                    Ok(()) => println!("Exported to {path}"),
                    Err(err) => println!("Export failed: {err:#}"),
                }
            }
            "import_data" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/import requires a path");
                    continue;
                };
                match read_snapshot(Path::new(&path)) {
                    Ok(payload) => match engine.import_data(&payload) {
                        Ok(()) => println!("Imported {path}"),
                        Err(err) => println!("Import failed: {err:#}"),
                    },
                    Err(err) => println!("Import failed: {err:#}"),
                }
            }
            "set_model" => {
                let Some(model) = value_as_non_empty_string(intent.command_args.get("model"))
                else {
                    println!("Model is {}", engine.model());
                    continue;
                };
                engine.set_model(model.clone());
                println!("Model set to {model}");
            }
            "quit" => break,
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            other => {
                println!("Unhandled action '{other}'");
            }
        }
    }

    Ok(())
}

fn run_send(args: SendArgs) -> Result<i32> {
    let mut engine = ChatEngine::open(&args.data, build_config(args.model, args.client))?;
    let attachment = match &args.image {
        Some(path) => Some(load_attachment(path)?),
        None => None,
    };

    let outcome = engine.send_message(&args.prompt, attachment)?;
    match outcome {
        SendOutcome::Completed { message } => {
            println!("{}", message.content);
            if let Some(banner) = engine.validation_errors() {
                eprintln!("Validation errors: {banner}");
                return Ok(0);
            }
            if let Some(error) = &message.error {
                eprintln!("{error}");
                return Ok(1);
            }
            Ok(0)
        }
        SendOutcome::Discarded => Ok(0),
    }
}

fn run_gallery(args: GalleryArgs) -> Result<i32> {
    let store = VisualStore::open(store_path(&args.data))?;
    let entries = store.search(args.query.as_deref().unwrap_or_default());
    if entries.is_empty() {
        println!("No gallery entries");
        return Ok(0);
    }
    for entry in entries {
        print_entry(&entry);
    }
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let store = KvStore::new(store_path(&args.data));
    let snapshot = store.export_all();
    fs::write(&args.out, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("failed writing {}", args.out.display()))?;
    println!("Exported to {}", args.out.display());
    Ok(0)
}

fn run_import(args: ImportArgs) -> Result<i32> {
    let store = KvStore::new(store_path(&args.data));
    let payload = read_snapshot(&args.file)?;
    store.import_all(&payload)?;
    println!("Imported {}", args.file.display());
    Ok(0)
}

fn read_snapshot(path: &Path) -> Result<Value> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn resolve_template_id(engine: &ChatEngine, name: &str) -> Option<String> {
    engine
        .templates()
        .templates()
        .iter()
        .find(|template| template.id == name || template.name.eq_ignore_ascii_case(name))
        .map(|template| template.id.clone())
}

fn last_user_message_id(engine: &ChatEngine) -> Option<String> {
    engine
        .current_session()?
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.id.clone())
}

fn print_message(message: &ChatMessage) {
    let role = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    println!("[{role}] {}", message.content);
    if message.image_data.is_some() {
        println!("  (image attached)");
    }
    if let Some(error) = &message.error {
        println!("  error: {error}");
    }
}

fn print_send_outcome(engine: &ChatEngine, outcome: SendOutcome) {
    match outcome {
        SendOutcome::Completed { message } => {
            print_message(&message);
            if let Some(banner) = engine.validation_errors() {
                println!("Validation errors: {banner}");
            }
            if let Some(usage) = &message.usage {
                println!("  ({} tokens, {} total)", usage.tokens, engine.usage_tokens());
            }
        }
        SendOutcome::Discarded => {
            println!("(stale response discarded)");
        }
    }
}

fn print_entry(entry: &VisualEntry) {
    let preview = json_preview(&entry.json);
    println!("{}  {}  {}", entry.id, entry.created_at, entry.title);
    if let Some(notes) = &entry.notes {
        println!("  notes: {notes}");
    }
    println!("  json: {preview}");
}

fn json_preview(json: &str) -> String {
    json.chars()
        .map(|ch| if ch == '\n' { ' ' } else { ch })
        .take(72)
        .collect()
}
