use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use streamchat::capabilities::{
    refresh_capabilities, spawn_capability_poller, upload_file, CapabilityClient,
    OngoingOperations,
};
use streamchat::completion::CompletionsClient;
use streamchat::config::validation::validate_base_url;
use streamchat::config::{load_config, AppConfig, EndpointConfig};
use streamchat::driver::{ConversationDriver, DriverConfig, TurnOutcome};
use streamchat::error::ChatError;
use streamchat::observability::init_tracing;
use streamchat::state::{SessionState, SessionUpdate};
use streamchat::store::{ChatStore, FileStore};
use streamchat::transport::{Endpoint, HttpTransport};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

const DEFAULT_FILE_ROLE: &str = "document";

const HELP: &str = "\
commands:
  /new                 start a new chat
  /chats               list chats
  /switch <id>         make another chat current
  /models              list models
  /model <id>          select the model for the next messages
  /files               list knowledge files
  /upload <path>       upload a knowledge file
  /delete <file_name>  delete a knowledge file
  /mcpl                list MCPL servers
  /endpoint <url> [key] change the endpoint
  /stop                stop the response for the current chat
  /quit                exit
anything else is sent to the current chat; Ctrl-C stops a running response";

const RUNTIME_WORKER_THREADS: usize = 2;

fn main() {
    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);
    let runtime = build_runtime();

    let result = runtime.block_on(run(config));
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(err.category().exit_code());
    }
}

fn build_runtime() -> tokio::runtime::Runtime {
    // Chat persistence writes synchronously; other workers keep reading
    // streams and handling Ctrl-C meanwhile.
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(RUNTIME_WORKER_THREADS)
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        })
}

/// Everything bound to the current endpoint; rebuilt when it changes.
struct Connection {
    driver: ConversationDriver,
    capabilities: CapabilityClient,
    poller_cancel: CancellationToken,
}

impl Connection {
    fn open(config: &AppConfig, state: &Arc<SessionState>) -> Self {
        let transport = Arc::new(HttpTransport::new(&config.endpoint));
        let endpoint = Arc::new(Endpoint::from_config(&config.endpoint));
        let completions = CompletionsClient::new(transport.clone(), endpoint.clone());
        let capabilities = CapabilityClient::new(transport, endpoint);
        let driver = ConversationDriver::new(
            state.clone(),
            completions,
            DriverConfig::from_app_config(config),
        );

        let poller_cancel = CancellationToken::new();
        state.capabilities().invalidate();
        spawn_capability_poller(
            capabilities.clone(),
            state.capabilities().clone(),
            Duration::from_secs(config.features.capability_poll_interval_secs),
            poller_cancel.clone(),
        );
        tracing::info!(endpoint = %config.endpoint.base_url, "connected");
        Self {
            driver,
            capabilities,
            poller_cancel,
        }
    }

    fn close(&self) {
        self.poller_cancel.cancel();
    }
}

async fn run(mut config: AppConfig) -> Result<(), ChatError> {
    let store = Arc::new(FileStore::new(Path::new(&config.storage.dir))?);
    if let Some(stored) = store.load_endpoint_config()? {
        match validate_base_url(&stored.url) {
            Ok(()) => config.endpoint = endpoint_with(&config.endpoint, stored.url, stored.api_key),
            Err(err) => tracing::warn!(error = %err, "ignoring stored endpoint"),
        }
    }

    let state = Arc::new(SessionState::load(
        store,
        &config.chat.model,
        config.features.capability_poll_interval_secs,
    )?);
    let mut connection = Connection::open(&config, &state);
    let operations = Arc::new(OngoingOperations::new());
    spawn_printer(state.clone());

    println!("{HELP}");
    print_current(&state);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    break;
                }
                let current = state.current_chat_id();
                if !connection.driver.stop(&current) {
                    break;
                }
                continue;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                eprintln!("failed to read input: {err}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(command) = line.strip_prefix('/') else {
            spawn_send(connection.driver.clone(), state.current_chat_id(), line.to_string());
            continue;
        };
        let (name, arg) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, arg)| (name, arg.trim()));
        match name {
            "quit" | "exit" => break,
            "help" => println!("{HELP}"),
            "new" => match state.new_chat() {
                Ok(_) => print_current(&state),
                Err(err) => eprintln!("{err}"),
            },
            "chats" => print_chats(&state),
            "switch" => match state.switch_chat(arg) {
                Ok(()) => print_current(&state),
                Err(err) => eprintln!("{err}"),
            },
            "models" => {
                refresh_now(&connection.capabilities, &state).await;
                let current = state.model();
                for model in state.capabilities().models() {
                    let marker = if model.id == current { '*' } else { ' ' };
                    println!("{marker} {} ({})", model.id, model.label());
                }
            }
            "model" if !arg.is_empty() => match connection.capabilities.retrieve_model(arg).await {
                Ok(model) => match state.set_model(&model.id) {
                    Ok(()) => println!("model: {}", model.id),
                    Err(err) => eprintln!("{err}"),
                },
                Err(err) => eprintln!("{err}"),
            },
            "files" => match connection.capabilities.list_files().await {
                Ok(files) => {
                    for file in &files {
                        println!("  {} ({})", file.file_name_orig, file.file_name);
                    }
                    state.capabilities().set_files(files);
                }
                Err(err) => eprintln!("{err}"),
            },
            "upload" if !arg.is_empty() => {
                spawn_upload(
                    connection.capabilities.clone(),
                    arg.to_string(),
                    operations.clone(),
                );
            }
            "delete" if !arg.is_empty() => match connection.capabilities.delete_file(arg).await {
                Ok(()) => {
                    if let Ok(files) = connection.capabilities.list_files().await {
                        state.capabilities().set_files(files);
                    }
                    println!("deleted {arg}");
                }
                Err(err) => eprintln!("{err}"),
            },
            "mcpl" => match connection.capabilities.list_mcpl_servers().await {
                Ok(servers) => {
                    for server in &servers {
                        println!("  {}", server.name);
                    }
                    state.capabilities().set_mcpl_servers(servers);
                }
                Err(err) => eprintln!("{err}"),
            },
            "endpoint" if !arg.is_empty() => {
                let (url, key) = arg
                    .split_once(char::is_whitespace)
                    .map_or((arg, ""), |(url, key)| (url, key.trim()));
                if let Err(err) = validate_base_url(url) {
                    eprintln!("{err}");
                    continue;
                }
                if let Err(err) = state.store().save_endpoint_config(url, key) {
                    eprintln!("{err}");
                    continue;
                }
                config.endpoint = endpoint_with(&config.endpoint, url.to_string(), key.to_string());
                connection.close();
                connection = Connection::open(&config, &state);
                println!("endpoint: {url}");
            }
            "stop" => {
                if !connection.driver.stop(&state.current_chat_id()) {
                    println!("nothing is streaming");
                }
            }
            _ => println!("unknown command; /help lists them"),
        }
    }

    connection.close();
    Ok(())
}

fn endpoint_with(base: &EndpointConfig, url: String, api_key: String) -> EndpointConfig {
    EndpointConfig {
        base_url: url,
        api_key,
        ..base.clone()
    }
}

async fn refresh_now(client: &CapabilityClient, state: &SessionState) {
    let cache = state.capabilities();
    if cache.try_begin_refresh(unix_now()) {
        refresh_capabilities(client, cache).await;
        cache.finish_refresh();
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

fn spawn_send(driver: ConversationDriver, chat_id: String, text: String) {
    tokio::spawn(async move {
        match driver.send(&chat_id, &text).await {
            Ok(TurnOutcome::Completed) => println!(),
            Ok(TurnOutcome::Cancelled) => println!("\n[stopped]"),
            Ok(TurnOutcome::Failed(err)) => println!("\n{}", err.user_message()),
            Err(err) => eprintln!("{err}"),
        }
    });
}

fn spawn_upload(client: CapabilityClient, path: String, operations: Arc<OngoingOperations>) {
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        match upload_file(&client, Path::new(&path), DEFAULT_FILE_ROLE, &operations, &cancel).await
        {
            Ok(()) => println!("uploaded {path}"),
            Err(err) if err.is_abort() => {}
            Err(err) => eprintln!("{err}"),
        }
        operations.clear_finished();
    });
}

/// Echo streamed text and titles for the current chat.
fn spawn_printer(state: Arc<SessionState>) {
    let mut updates = state.subscribe();
    tokio::spawn(async move {
        loop {
            let update = match updates.recv().await {
                Ok(update) => update,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "renderer fell behind");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match update {
                SessionUpdate::ContentDelta { chat_id, text } if chat_id == state.current_chat_id() => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                SessionUpdate::Titled { chat_id, name } => {
                    tracing::info!(chat_id = %chat_id, "titled '{name}'");
                }
                _ => {}
            }
        }
    });
}

fn print_current(state: &SessionState) {
    if let Some(chat) = state.current_chat() {
        println!("chat {} [{}] model {}", chat.id, chat.display_name(), state.model());
        for message in &chat.messages {
            if !message.content.is_empty() {
                println!("{}: {}", message.role.as_str(), message.content);
            }
        }
    }
}

fn print_chats(state: &SessionState) {
    let current = state.current_chat_id();
    for chat in state.chats() {
        let marker = if chat.id == current { '*' } else { ' ' };
        println!(
            "{marker} {} {} ({} messages)",
            chat.id,
            chat.display_name(),
            chat.messages.len()
        );
    }
}
