use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

use murmur::conversation::{MessageKey, STREAMING_MARKER};
use murmur::telemetry::init_tracing;
use murmur::{
    ConversationController, DisplayEvent, MessageStatus, PullOutcome, SettingsStore,
    StartupError, open_controller,
};
use murmur_llm::Role;
use murmur_storage::{SessionId, SystemPromptId};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  /new              start a new conversation
  /sessions         list saved conversations
  /open <id>        switch to a saved conversation
  /delete <id>      delete a saved conversation
  /model [id]       show or change the model
  /models           list models on the server
  /pull <id>        download a model onto the server
  /rmmodel <id>     remove a model from the server
  /status           check whether the model server is reachable
  /prompts          list system prompts
  /prompt <id>      activate a system prompt
  /stop             stop the streaming reply, or else the running pull
  /quit             exit
anything else is sent to the model";

enum Command<'a> {
    Send(&'a str),
    New,
    Sessions,
    Open(&'a str),
    Delete(&'a str),
    Model(Option<&'a str>),
    Models,
    Pull(&'a str),
    RemoveModel(&'a str),
    Status,
    Prompts,
    Prompt(&'a str),
    Stop,
    Help,
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Send(line);
        };
        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };
        match name {
            "new" => Self::New,
            "sessions" => Self::Sessions,
            "open" => Self::Open(argument),
            "delete" => Self::Delete(argument),
            "model" => Self::Model((!argument.is_empty()).then_some(argument)),
            "models" => Self::Models,
            "pull" => Self::Pull(argument),
            "rmmodel" => Self::RemoveModel(argument),
            "status" => Self::Status,
            "prompts" => Self::Prompts,
            "prompt" => Self::Prompt(argument),
            "stop" => Self::Stop,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(name),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "murmur failed to start");
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let settings = Arc::new(SettingsStore::load());
    let (display_tx, display_rx) = mpsc::unbounded_channel();
    let controller = Arc::new(open_controller(settings, display_tx).await?);

    let printer = tokio::spawn(print_display_events(display_rx));
    let mut lines = spawn_stdin_reader();

    println!("murmur, model {}. /help for commands.", controller.model_id());
    if !controller.server_available().await {
        eprintln!("! the model server is not reachable; replies will fail until it is running");
    }
    while let Some(line) = lines.recv().await {
        match Command::parse(&line) {
            Command::Quit => break,
            command => handle_command(&controller, command).await,
        }
    }

    controller.stop();
    controller.cancel_pull();
    drop(controller);
    printer.abort();
    Ok(())
}

async fn handle_command(controller: &Arc<ConversationController>, command: Command<'_>) {
    match command {
        Command::Send("") => {}
        Command::Send(text) => {
            let controller = controller.clone();
            let text = text.to_string();
            tokio::spawn(async move {
                if let Err(error) = controller.submit(&text).await {
                    eprintln!("! {error}");
                }
            });
        }
        Command::New => report(controller.new_session()),
        Command::Sessions => match controller.refresh_sessions() {
            Ok(sessions) if sessions.is_empty() => println!("no saved conversations"),
            Ok(sessions) => {
                let active = controller.session_id();
                for session in sessions {
                    let marker = if Some(session.id) == active { '*' } else { ' ' };
                    println!(
                        "{marker} {:>4}  {}  {}",
                        session.id, session.updated_at, session.title
                    );
                }
            }
            Err(error) => eprintln!("! {error}"),
        },
        Command::Open(raw) => match raw.parse::<SessionId>() {
            Ok(session_id) => report(controller.switch_session(session_id).map(|_| ())),
            Err(error) => eprintln!("! {error}"),
        },
        Command::Delete(raw) => match raw.parse::<SessionId>() {
            Ok(session_id) => report(controller.delete_session(session_id)),
            Err(error) => eprintln!("! {error}"),
        },
        Command::Model(None) => println!("model: {}", controller.model_id()),
        Command::Model(Some(model_id)) => report(controller.set_model(model_id)),
        Command::Models => match controller.list_models().await {
            Ok(catalog) => {
                let current = controller.model_id();
                for model in catalog.models {
                    let marker = if model.id == current { '*' } else { ' ' };
                    match model.summary() {
                        Some(summary) => println!("{marker} {}  ({summary})", model.id),
                        None => println!("{marker} {}", model.id),
                    }
                }
            }
            Err(error) => eprintln!("! {error}"),
        },
        Command::Pull(model_id) => {
            let controller = controller.clone();
            let model_id = model_id.to_string();
            tokio::spawn(async move {
                match controller.pull_model(&model_id).await {
                    Ok(PullOutcome::Cancelled) => println!("pull of {model_id} cancelled"),
                    Ok(PullOutcome::Completed) => {}
                    Err(error) => eprintln!("! {error}"),
                }
            });
        }
        Command::RemoveModel(model_id) => match controller.delete_model(model_id).await {
            Ok(()) => println!("removed {}", model_id.trim()),
            Err(error) => eprintln!("! {error}"),
        },
        Command::Status => {
            let reachable = if controller.server_available().await {
                "reachable"
            } else {
                "not reachable"
            };
            println!("model server {reachable}, model {}", controller.model_id());
            if let Some(model_id) = controller.pulling_model() {
                println!("pulling {model_id}");
            }
        }
        Command::Prompts => match controller.list_system_prompts() {
            Ok(prompts) => {
                for prompt in prompts {
                    let marker = if prompt.is_active { '*' } else { ' ' };
                    println!("{marker} {:>4}  {}", prompt.id, prompt.name);
                }
            }
            Err(error) => eprintln!("! {error}"),
        },
        Command::Prompt(raw) => match raw.parse::<SystemPromptId>() {
            Ok(prompt_id) => report(controller.set_active_system_prompt(prompt_id)),
            Err(error) => eprintln!("! {error}"),
        },
        Command::Stop => {
            if !controller.stop() && !controller.cancel_pull() {
                println!("nothing is running");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Unknown(name) => eprintln!("! unknown command /{name}; /help lists commands"),
        Command::Quit => {}
    }
}

fn report(result: murmur::ConversationResult<()>) {
    if let Err(error) = result {
        eprintln!("! {error}");
    }
}

/// Blocking stdin reads run on their own thread and are forwarded line by line.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read stdin");
                    break;
                }
            }
        }
    });
    line_rx
}

async fn print_display_events(mut display_rx: mpsc::UnboundedReceiver<DisplayEvent>) {
    // Text already printed for each message that is still streaming.
    let mut printed: HashMap<MessageKey, String> = HashMap::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = display_rx.recv().await {
        match event {
            DisplayEvent::MessageAppended(message) => {
                if message.role == Role::Assistant && message.is_streaming() {
                    print!("assistant> ");
                    printed.insert(message.key, String::new());
                }
            }
            DisplayEvent::MessageUpdated { key, text, status } => {
                let visible = text.trim_end_matches(STREAMING_MARKER);
                let previous = printed.remove(&key).unwrap_or_default();
                match visible.strip_prefix(previous.as_str()) {
                    Some(suffix) => print!("{suffix}"),
                    None => print!("\n{visible}"),
                }
                if matches!(status, MessageStatus::Streaming(_)) {
                    printed.insert(key, visible.to_string());
                } else {
                    println!();
                }
            }
            DisplayEvent::MessagesReplaced { session_id, messages } => {
                printed.clear();
                match session_id {
                    Some(session_id) => println!("-- conversation {session_id} --"),
                    None => println!("-- new conversation --"),
                }
                for message in messages {
                    let speaker = match message.role {
                        Role::User => "you",
                        Role::Assistant => "assistant",
                        Role::System => "system",
                    };
                    println!("{speaker}> {}", message.content);
                }
            }
            DisplayEvent::SessionsRefreshed(sessions) => {
                tracing::debug!(session_count = sessions.len(), "session list refreshed");
            }
            DisplayEvent::PullProgress { model_id, progress } => {
                println!("[{model_id}] {}", progress.summary());
            }
            DisplayEvent::Notice(text) => eprintln!("! {text}"),
        }
        let _ = stdout.flush();
    }
}
