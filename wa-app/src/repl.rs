//! `wpagent chat`: line-oriented terminal driver for one session.

use crate::config::{SiteMode, WpAgentConfig};
use crate::executor::{ActionExecutor, LocalExecutor, RemoteExecutor};
use crate::server::open_local_sandbox;
use crate::session::{SessionCommand, SessionController, SessionEvent, SessionSettings};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use wa_llm::OpenAiCompatProvider;

const ARGS_PREVIEW_CHARS: usize = 400;

const HELP: &str = "commands: /confirm  /cancel  /auto on|off  /queue  /edit <text>  /unqueue  /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Prompt(String),
    Confirm,
    Cancel,
    Auto(bool),
    ShowQueue,
    EditQueued(String),
    Unqueue,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Prompt(line.to_string());
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match (name, rest) {
        ("confirm", "") => Input::Confirm,
        ("cancel", "") => Input::Cancel,
        ("auto", "on") => Input::Auto(true),
        ("auto", "off") => Input::Auto(false),
        ("auto", _) => Input::Invalid("usage: /auto on|off".to_string()),
        ("queue", "") => Input::ShowQueue,
        ("edit", "") => Input::Invalid("usage: /edit <text>".to_string()),
        ("edit", text) => Input::EditQueued(text.to_string()),
        ("unqueue", "") => Input::Unqueue,
        ("help", _) => Input::Help,
        ("quit" | "exit", "") => Input::Quit,
        _ => Input::Invalid(format!("unknown command /{name}; {HELP}")),
    }
}

fn preview(value: &serde_json::Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= ARGS_PREVIEW_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(ARGS_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Terminal text for one event. Deltas are printed as-is so streamed text
/// reads continuously.
pub fn render(event: &SessionEvent) -> String {
    match event {
        SessionEvent::TextDelta { content } => content.clone(),
        SessionEvent::ActionPending { action, risk } => format!(
            "\n[{} risk] {} {}\n  {}\n  /confirm to run it, /cancel to discard\n",
            risk.as_str().to_ascii_uppercase(),
            action.name,
            preview(&serde_json::Value::Object(action.args.clone())),
            risk.warning()
        ),
        SessionEvent::ActionAutoApproved { action, risk } => {
            format!("\n[auto] {} ({} risk)\n", action.name, risk)
        }
        SessionEvent::ActionResult {
            name,
            success: true,
            payload,
        } => format!("[ok] {name} {}\n", preview(payload)),
        SessionEvent::ActionResult {
            name,
            success: false,
            payload,
        } => format!(
            "[failed] {name}: {}\n",
            payload["error"].as_str().unwrap_or("unknown error")
        ),
        SessionEvent::ActionCancelled { name } => format!("[cancelled] {name}\n"),
        SessionEvent::PromptQueued { position } => format!("[queued #{position}]\n"),
        SessionEvent::TurnFinished => "\n".to_string(),
        SessionEvent::ProviderFailed { message } => format!("\n[provider error] {message}\n"),
    }
}

async fn render_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let text = render(&event);
        if let Err(e) = stdout.write_all(text.as_bytes()).await {
            tracing::error!(error = %e, "stdout write failed");
            return;
        }
        let _ = stdout.flush().await;
    }
}

fn build_executor(cfg: &WpAgentConfig) -> Result<Arc<dyn ActionExecutor>> {
    let executor: Arc<dyn ActionExecutor> = match cfg.site.mode {
        SiteMode::Local => Arc::new(LocalExecutor::new(open_local_sandbox(cfg)?)),
        SiteMode::Remote => Arc::new(RemoteExecutor::new(
            &cfg.site.remote_url,
            &cfg.site.access_key,
            cfg.site_timeout(),
        )?),
    };
    Ok(executor)
}

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = WpAgentConfig::load(config_path).await?;
    let provider = OpenAiCompatProvider::new(
        &cfg.provider.base_url,
        cfg.api_key()?,
        &cfg.general.model,
        cfg.provider_timeout(),
    )?;
    let executor = build_executor(&cfg)?;
    let tools = wa_sandbox::action_definitions()?;
    let (session, events) = SessionController::new(
        Arc::new(provider),
        executor.clone(),
        tools,
        SessionSettings {
            system_prompt: cfg.general.system_prompt.clone(),
            auto_execute: cfg.general.auto_execute,
            tool_loops_max: cfg.general.tool_loops_max,
        },
    );
    println!(
        "wpagent chat ({}, {}, auto-execute {})",
        cfg.general.model,
        executor.describe(),
        if cfg.general.auto_execute { "on" } else { "off" }
    );
    println!("{HELP}");

    let (handle, actor) = session.spawn();
    let printer = tokio::spawn(render_events(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_input(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => {
                println!("{HELP}");
                continue;
            }
            Input::Invalid(message) => {
                println!("{message}");
                continue;
            }
            Input::ShowQueue => {
                let queued = handle.queued().await?;
                if queued.is_empty() {
                    println!("queue is empty");
                }
                for (i, text) in queued.iter().enumerate() {
                    println!("  {}. {text}", i + 1);
                }
                continue;
            }
            Input::Prompt(text) => SessionCommand::Submit(text),
            Input::Confirm => SessionCommand::Confirm,
            Input::Cancel => SessionCommand::Cancel,
            Input::Auto(enabled) => {
                println!("auto-execute {}", if enabled { "on" } else { "off" });
                SessionCommand::SetAutoExecute(enabled)
            }
            Input::EditQueued(text) => SessionCommand::EditQueuedTail(text),
            Input::Unqueue => SessionCommand::RemoveQueuedTail,
        };
        handle.send(command).await?;
    }

    // Stop reading; let the actor finish its current turn.
    let _ = handle.send(SessionCommand::Close).await;
    drop(handle);
    if let Err(e) = actor.await {
        tracing::error!(error = %e, "session actor join failed");
    }
    if let Err(e) = printer.await {
        tracing::error!(error = %e, "event printer join failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskTier;
    use serde_json::json;
    use wa_llm::ProposedAction;

    #[test]
    fn plain_lines_are_prompts() {
        assert_eq!(
            parse_input("  list my plugins "),
            Input::Prompt("list my plugins".to_string())
        );
        assert_eq!(parse_input("   "), Input::Empty);
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_input("/confirm"), Input::Confirm);
        assert_eq!(parse_input("/cancel"), Input::Cancel);
        assert_eq!(parse_input("/auto on"), Input::Auto(true));
        assert_eq!(parse_input("/auto  off"), Input::Auto(false));
        assert_eq!(parse_input("/queue"), Input::ShowQueue);
        assert_eq!(
            parse_input("/edit deactivate akismet instead"),
            Input::EditQueued("deactivate akismet instead".to_string())
        );
        assert_eq!(parse_input("/unqueue"), Input::Unqueue);
        assert_eq!(parse_input("/quit"), Input::Quit);
    }

    #[test]
    fn malformed_commands_explain_themselves() {
        assert!(matches!(parse_input("/auto maybe"), Input::Invalid(m) if m.contains("/auto on|off")));
        assert!(matches!(parse_input("/edit"), Input::Invalid(_)));
        assert!(matches!(parse_input("/rm -rf"), Input::Invalid(m) if m.contains("/rm")));
    }

    #[test]
    fn pending_actions_show_tier_and_warning() {
        let mut args = serde_json::Map::new();
        args.insert("assetType".to_string(), json!("plugin"));
        let text = render(&SessionEvent::ActionPending {
            action: ProposedAction {
                id: "c1".to_string(),
                name: "delete_asset".to_string(),
                args,
            },
            risk: RiskTier::High,
        });
        assert!(text.contains("[HIGH risk] delete_asset"));
        assert!(text.contains(RiskTier::High.warning()));
    }

    #[test]
    fn long_payloads_are_truncated() {
        let payload = json!({ "content": "x".repeat(2_000) });
        let text = render(&SessionEvent::ActionResult {
            name: "read_file_content".to_string(),
            success: true,
            payload,
        });
        assert!(text.ends_with("...\n"));
        assert!(text.len() < 600);
    }

    #[test]
    fn failures_show_the_error_message() {
        let text = render(&SessionEvent::ActionResult {
            name: "get_db_tables".to_string(),
            success: false,
            payload: json!({ "error": "sandbox unreachable", "error_code": "execution_error" }),
        });
        assert_eq!(text, "[failed] get_db_tables: sandbox unreachable\n");
    }
}
