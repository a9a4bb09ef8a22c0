// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clap::Parser;
use cli::{Cli, Commands, CredentialsCommands};
use tm_bootstrap::{
    dispatch_tasks, AgentDefinition, BatchDetails, BatchSignal, DispatchContext, RuntimeContext, TaskBatch,
};
use tm_core::AgentRuntimeContext;
use tm_editor::{Editor, EditorAction};
use tm_model::{CredentialRotator, CredentialStore, JsonFileCredentialStore, OverrideStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::RunBatch { file } => run_batch(&file, cli.config.as_deref()).await,
        Commands::Credentials { command } => run_credentials(command, cli.config.as_deref()).await,
        Commands::EditDemo => run_edit_demo(),
    }
}

// ─── run-batch ────────────────────────────────────────────────────────────────

async fn run_batch(file: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let batch_text =
        std::fs::read_to_string(file).with_context(|| format!("reading task batch file {}", file.display()))?;
    let batch: TaskBatch = parse_batch_file(file, &batch_text)?;

    let config = Arc::new(tm_config::load(config_path)?);
    let model: Arc<dyn tm_model::ModelProvider> = Arc::from(tm_model::from_config(&config.model)?);
    let runtime_ctx = RuntimeContext::auto_detect();
    let runtime = AgentRuntimeContext {
        project_root: runtime_ctx.project_root,
        git_context_note: runtime_ctx.git_context.and_then(|g| g.to_prompt_section()),
        ci_context_note: runtime_ctx.ci_context.and_then(|c| c.to_prompt_section()),
        project_context_file: runtime_ctx.project_context_file,
        append_system_prompt: None,
        system_prompt_override: None,
        ..Default::default()
    };

    let project_root = tm_runtime::find_project_root().ok();
    let agents: Vec<AgentDefinition> = tm_runtime::discover_agents(project_root.as_deref())
        .iter()
        .map(AgentDefinition::from_agent_info)
        .collect();

    let ctx = DispatchContext {
        config,
        model,
        runtime,
        agents,
        spawn_whitelist: String::new(),
        depth: Arc::new(AtomicUsize::new(0)),
    };

    let (summary, details) = dispatch_tasks(batch, BatchSignal::new(), &ctx).await?;

    println!("{summary}");
    println!("{}", serde_json::to_string_pretty(&batch_details_json(&details))?);
    Ok(())
}

fn parse_batch_file(path: &Path, text: &str) -> anyhow::Result<TaskBatch> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(text).with_context(|| format!("parsing {} as YAML", path.display()))
        }
        _ => serde_json::from_str(text).with_context(|| format!("parsing {} as JSON", path.display())),
    }
}

/// Mirrors `tm_bootstrap::task_dispatch`'s internal `details_as_value` shape
/// (results + totals) since that helper is private to the tool-call path.
fn batch_details_json(details: &BatchDetails) -> serde_json::Value {
    serde_json::json!({
        "results": details.results,
        "totals": details.totals,
    })
}

// ─── credentials ──────────────────────────────────────────────────────────────

fn credential_store_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("taskmux/credentials.json"))
        .unwrap_or_else(|| PathBuf::from(".taskmux/credentials.json"))
}

fn override_store_path() -> PathBuf {
    let mut path = credential_store_path();
    path.set_file_name("credential_overrides.json");
    path
}

async fn run_credentials(command: CredentialsCommands, config_path: Option<&Path>) -> anyhow::Result<()> {
    let _config = tm_config::load(config_path)?;
    let store_path = credential_store_path();

    match command {
        CredentialsCommands::List => {
            let store = JsonFileCredentialStore::open(&store_path)?.load_all()?;
            if store.is_empty() {
                println!("no credentials stored at {}", store_path.display());
                return Ok(());
            }
            for (provider, credential) in store {
                println!("{provider}: {} ({})", redact(&credential), credential.kind().label());
            }
            Ok(())
        }
        CredentialsCommands::Status { provider } => {
            let store = JsonFileCredentialStore::open(&store_path)?;
            let mut rotator = CredentialRotator::new();
            let creds: Vec<tm_model::Credential> = store
                .load_all()?
                .into_iter()
                .filter(|(p, _)| p == &provider)
                .map(|(_, c)| c)
                .collect();
            rotator.store_credentials(&provider, creds);

            let now_ms = chrono::Utc::now().timestamp_millis();
            let summaries = rotator.summarize(&provider, now_ms);
            if summaries.is_empty() {
                println!("no stored credentials for provider \"{provider}\"");
            }
            for s in &summaries {
                let state = if s.blocked {
                    format!("blocked until {}", s.blocked_until_ms.unwrap_or_default())
                } else {
                    "available".to_string()
                };
                println!("id {}: {} — {state}", s.id, s.kind.label());
            }
            println!("active session affinities: {}", rotator.affinity_sessions(&provider));

            let overrides = OverrideStore::open(override_store_path())?;
            match overrides.get(&provider) {
                Some(_) => println!("override: set (takes precedence over rotation)"),
                None => println!("override: none"),
            }
            Ok(())
        }
        CredentialsCommands::SetOverride { provider, key } => {
            let mut overrides = OverrideStore::open(override_store_path())?;
            overrides.set(&provider, key)?;
            println!("override set for \"{provider}\"");
            Ok(())
        }
        CredentialsCommands::ClearOverride { provider } => {
            let mut overrides = OverrideStore::open(override_store_path())?;
            overrides.clear(&provider)?;
            println!("override cleared for \"{provider}\"");
            Ok(())
        }
    }
}

fn redact(credential: &tm_model::Credential) -> &'static str {
    match credential.kind() {
        tm_model::CredentialKind::ApiKey => "sk-***",
        tm_model::CredentialKind::OAuth => "oauth-***",
    }
}

trait CredentialKindLabel {
    fn label(&self) -> &'static str;
}

impl CredentialKindLabel for tm_model::CredentialKind {
    fn label(&self) -> &'static str {
        match self {
            tm_model::CredentialKind::ApiKey => "api key",
            tm_model::CredentialKind::OAuth => "oauth",
        }
    }
}

// ─── edit-demo ────────────────────────────────────────────────────────────────

fn run_edit_demo() -> anyhow::Result<()> {
    enable_raw_mode()?;
    let result = edit_demo_loop();
    disable_raw_mode()?;
    println!();
    result
}

fn edit_demo_loop() -> anyhow::Result<()> {
    use std::io::{Read, Write};

    let mut editor = Editor::new();
    let mut stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 256];

    println!("edit-demo: type, Enter to submit a non-slash line, Ctrl-C to exit\r");
    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if buf[..n].contains(&0x03) {
            break;
        }
        let actions = editor.feed_bytes(&buf[..n], 80, None);
        for action in actions {
            if let EditorAction::Submitted(text) = action {
                write!(stdout, "\r\nsubmitted: {text:?}\r\n")?;
                stdout.flush()?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn enable_raw_mode() -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = std::io::stdin().as_raw_fd();
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            anyhow::bail!("tcgetattr failed");
        }
        let original = termios;
        libc::cfmakeraw(&mut termios);
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            anyhow::bail!("tcsetattr failed");
        }
        RAW_MODE_ORIGINAL.with(|cell| *cell.borrow_mut() = Some(original));
    }
    Ok(())
}

#[cfg(unix)]
fn disable_raw_mode() -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = std::io::stdin().as_raw_fd();
    RAW_MODE_ORIGINAL.with(|cell| -> anyhow::Result<()> {
        if let Some(original) = cell.borrow_mut().take() {
            unsafe {
                if libc::tcsetattr(fd, libc::TCSANOW, &original) != 0 {
                    anyhow::bail!("tcsetattr restore failed");
                }
            }
        }
        Ok(())
    })
}

#[cfg(unix)]
thread_local! {
    static RAW_MODE_ORIGINAL: std::cell::RefCell<Option<libc::termios>> = std::cell::RefCell::new(None);
}

#[cfg(not(unix))]
fn enable_raw_mode() -> anyhow::Result<()> {
    anyhow::bail!("edit-demo requires a unix terminal")
}

#[cfg(not(unix))]
fn disable_raw_mode() -> anyhow::Result<()> {
    Ok(())
}

// ─── logging ──────────────────────────────────────────────────────────────────

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
