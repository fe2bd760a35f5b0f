//! Command handlers for the vaultchat binary
//!
//! A thin consumer of the library: every state change goes through
//! `ConversationManager`, and progress is read back from `CoreEvent`s.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use vaultchat::config::{Config, Secrets, ENV_ENCRYPTED_API_KEY, ENV_ENCRYPTION_KEY};
use vaultchat::core::{AttachmentRef, ChatError, GenerationParams, SessionHealth};
use vaultchat::llm::ClaudeBackend;
use vaultchat::{ConversationManager, CoreEvent, EventBus, FileBlobStore, Vault};

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Build the manager from config and environment secrets
fn open_manager(
    config: &Config,
    require_credential: bool,
) -> Result<(ConversationManager, UnboundedReceiver<CoreEvent>)> {
    let secrets = Secrets::from_env()?;
    let vault = Arc::new(Vault::from_base64(&secrets.encryption_key).with_context(|| {
        format!(
            "{} must be a base64 32-byte key (see `vaultchat keygen`)",
            ENV_ENCRYPTION_KEY
        )
    })?);

    let api_key = match secrets.api_key {
        Some(key) => key,
        None if require_credential => bail!(
            "No API credential: set ANTHROPIC_API_KEY or {}",
            ENV_ENCRYPTED_API_KEY
        ),
        // Commands that never reach the service
        None => String::new(),
    };

    let root = config.storage_root();
    let store = Arc::new(
        FileBlobStore::new(&root)
            .with_context(|| format!("Failed to open session storage at {}", root.display()))?,
    );
    let backend = Arc::new(ClaudeBackend::new(api_key, &config.llm));
    let (events, rx) = EventBus::channel();

    tracing::debug!(root = %root.display(), "Opened session storage");
    Ok((
        ConversationManager::new(config, vault, store, backend, events),
        rx,
    ))
}

pub async fn run_chat(config: &Config, session: Option<String>, preset: Option<String>) -> Result<()> {
    let (manager, mut events) = open_manager(config, true)?;

    let mut id = match session {
        Some(id) => id,
        None => manager.create_session(None)?,
    };
    manager.switch_active(&id)?;
    if let Some(preset) = preset {
        manager.apply_preset(&id, &preset)?;
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let CoreEvent::RetryAttempted {
                attempt,
                max_attempts,
                delay,
                ..
            } = event
            {
                eprintln!(
                    "  (attempt {}/{} failed, retrying in {:.1}s)",
                    attempt,
                    max_attempts,
                    delay.as_secs_f64()
                );
            }
        }
    });

    println!("Session {} (type /help for commands, /quit to leave)", id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Vec<AttachmentRef> = Vec::new();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match handle_command(&manager, &mut id, &mut pending, command) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("error: {}", e);
                    continue;
                }
            }
        }

        let cancel = CancellationToken::new();
        let send = manager.send_with_attachments(&id, line, std::mem::take(&mut pending), cancel.clone());
        tokio::pin!(send);
        let result = tokio::select! {
            result = &mut send => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                send.await
            }
        };

        match result {
            Ok(report) => println!("\n{}\n", report.reply.text),
            Err(ChatError::Cancelled) => println!("(cancelled)"),
            Err(e) => eprintln!("error [{}]: {}", e.kind(), e),
        }
    }

    manager.shutdown().await?;
    drop(manager);
    printer.abort();
    Ok(())
}

/// Handle a slash command; `Ok(false)` ends the chat
fn handle_command(
    manager: &ConversationManager,
    id: &mut String,
    pending: &mut Vec<AttachmentRef>,
    command: &str,
) -> Result<bool> {
    let (name, arg) = match command.split_once(' ') {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    match name {
        "quit" | "exit" => return Ok(false),
        "help" => {
            println!("/presets                 list prompt presets");
            println!("/preset NAME             apply a preset");
            println!("/system TEXT             set a custom system prompt");
            println!("/temp VALUE              set temperature");
            println!("/max-tokens N            set max output tokens");
            println!("/attach PATH             attach an image to the next message");
            println!("/title TEXT              rename this session");
            println!("/usage                   show token usage");
            println!("/sessions                list sessions");
            println!("/switch ID               switch to another session");
            println!("/new                     start a new session");
            println!("/quit                    leave");
        }
        "presets" => println!("{}", manager.preset_names().join(", ")),
        "preset" => {
            manager.apply_preset(id, arg)?;
            println!("Preset '{}' applied", arg);
        }
        "system" => {
            let session = manager.get_or_load(id)?;
            session.switch_system_prompt(arg)?;
            manager.persist(id)?;
        }
        "temp" | "max-tokens" => {
            let session = manager.get_or_load(id)?;
            let current = session.params();
            let params = if name == "temp" {
                GenerationParams {
                    temperature: arg.parse().context("temperature must be a number")?,
                    ..current
                }
            } else {
                GenerationParams {
                    max_output_tokens: arg.parse().context("max tokens must be an integer")?,
                    ..current
                }
            };
            session.update_parameters(params)?;
            manager.persist(id)?;
        }
        "attach" => {
            let path = PathBuf::from(arg);
            if !path.is_file() {
                bail!("no such file: {}", arg);
            }
            let attachment = AttachmentRef::from_path(&path);
            println!("Attached {} ({})", attachment.name, attachment.media_type);
            pending.push(attachment);
        }
        "title" => manager.rename_session(id, arg)?,
        "usage" => {
            let usage = manager.get_or_load(id)?.usage();
            println!(
                "{} input + {} output = {} tokens",
                usage.input_tokens,
                usage.output_tokens,
                usage.total()
            );
        }
        "sessions" => print_sessions(manager)?,
        "switch" => {
            manager.switch_active(arg)?;
            *id = arg.to_string();
            pending.clear();
            println!("Switched to {}", id);
        }
        "new" => {
            let new_id = manager.create_session(None)?;
            manager.switch_active(&new_id)?;
            *id = new_id;
            pending.clear();
            println!("Session {}", id);
        }
        other => bail!("unknown command /{} (try /help)", other),
    }
    Ok(true)
}

fn print_sessions(manager: &ConversationManager) -> Result<()> {
    for meta in manager.list_sessions()? {
        let marker = if meta.is_foreground { "*" } else { " " };
        let updated = meta
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        match meta.health {
            SessionHealth::Ok => println!(
                "{} {}  {}  {:>4} msgs  {}",
                marker, meta.id, updated, meta.message_count, meta.title
            ),
            SessionHealth::Unreadable(kind) => {
                println!("{} {}  unreadable ({})", marker, meta.id, kind)
            }
        }
    }
    Ok(())
}

pub fn run_list(config: &Config, json: bool) -> Result<()> {
    let (manager, _events) = open_manager(config, false)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&manager.list_sessions()?)?);
    } else {
        print_sessions(&manager)?;
    }
    Ok(())
}

pub fn run_new(config: &Config, title: Option<&str>) -> Result<()> {
    let (manager, _events) = open_manager(config, false)?;
    let id = manager.create_session(title)?;
    println!("{}", id);
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let (manager, _events) = open_manager(config, false)?;
    manager.delete_session(id).await?;
    println!("Deleted {}", id);
    Ok(())
}

pub fn run_export(config: &Config, id: &str, output: Option<PathBuf>) -> Result<()> {
    let (manager, _events) = open_manager(config, false)?;
    let markdown = manager.get_or_load(id)?.export_markdown();
    match output {
        Some(path) => {
            std::fs::write(&path, markdown)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported {} to {}", id, path.display());
        }
        None => print!("{}", markdown),
    }
    Ok(())
}

pub fn run_keygen() -> Result<()> {
    println!("{}={}", ENV_ENCRYPTION_KEY, Vault::generate_key());
    Ok(())
}

pub fn run_encrypt_credential() -> Result<()> {
    let key = std::env::var(ENV_ENCRYPTION_KEY)
        .with_context(|| format!("{} environment variable not set", ENV_ENCRYPTION_KEY))?;
    let vault = Vault::from_base64(&key)?;

    eprint!("Credential: ");
    std::io::stderr().flush()?;
    let mut credential = String::new();
    std::io::stdin().read_line(&mut credential)?;
    let credential = credential.trim();
    if credential.is_empty() {
        bail!("empty credential");
    }

    println!("{}={}", ENV_ENCRYPTED_API_KEY, vault.encrypt_credential(credential)?);
    Ok(())
}
