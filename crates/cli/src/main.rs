use std::sync::Arc;

use anima_core::agent::AgentEvent;
use anima_core::{Runtime, RuntimeOptions};
use anima_llm::provider::LlmProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let options = RuntimeOptions {
        db_path: std::env::var("ANIMA_DB").unwrap_or_else(|_| "anima.db".into()).into(),
        workspace: std::env::var("ANIMA_WORKSPACE").unwrap_or_else(|_| "workspace".into()).into(),
        ..Default::default()
    };

    let provider: Arc<dyn LlmProvider> = match anima_llm::http::from_env() {
        Some(p) => {
            tracing::info!(provider = p.name(), model = p.model(), "LLM provider ready");
            Arc::new(p)
        }
        None => {
            anyhow::bail!("set ANIMA_LLM_MODEL and ANIMA_LLM_API_KEY to start");
        }
    };
    let reflection: Option<Arc<dyn LlmProvider>> =
        anima_llm::http::reflection_from_env().map(|p| {
            tracing::info!(model = p.model(), "reflection provider ready");
            Arc::new(p) as Arc<dyn LlmProvider>
        });
    if reflection.is_none() {
        tracing::warn!("ANIMA_LLM_LITE_MODEL not set; reflection uses the primary model");
    }

    let runtime = Runtime::new(options, provider, reflection).await?;
    runtime.shutdown_coordinator().spawn_signal_listener();

    if std::env::var("ANIMA_AUTONOMOUS").as_deref() == Ok("1")
        && runtime.spawn_consciousness().is_some()
    {
        tracing::info!("consciousness driver running");
    }

    let session_id = format!("cli-{}", session_suffix());
    let mut editor = rustyline::DefaultEditor::new()?;
    println!("anima ready. Type a task, or press Ctrl-D to quit.");

    loop {
        if runtime.shutdown_coordinator().is_shutting_down() {
            break;
        }
        match editor.readline("you> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match runtime.chat(line, &session_id) {
                    Ok(mut rx) => {
                        while let Some(event) = rx.recv().await {
                            render(&event);
                            if event.is_terminal() {
                                break;
                            }
                        }
                    }
                    Err(e) => eprintln!("cannot start run: {e}"),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn render(event: &AgentEvent) {
    match event {
        AgentEvent::Thinking(text) => println!("  … {}", first_line(text)),
        AgentEvent::Text(text) => println!("{text}"),
        AgentEvent::ToolCall { name, args } => println!("  → {name} {args}"),
        AgentEvent::ToolResult { name, result } => {
            let marker = if result.success { "✓" } else { "✗" };
            println!("  {marker} {name}: {}", first_line(&result.output));
            if let Some(error) = &result.error {
                println!("    {error}");
            }
        }
        AgentEvent::StuckWarning(message) => println!("  ! {message}"),
        AgentEvent::Error(message) => eprintln!("error: {message}"),
        AgentEvent::Done(summary) => println!("done: {}", first_line(summary)),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn session_suffix() -> String {
    let nanos =
        std::time::UNIX_EPOCH.elapsed().map(|d| d.subsec_nanos()).unwrap_or(0);
    format!("{:08x}", std::process::id() ^ nanos)
}
