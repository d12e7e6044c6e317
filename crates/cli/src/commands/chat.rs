//! `quill chat`: Interactive or single-message chat mode.

use clap::Args;
use quill_config::AppConfig;
use quill_core::error::GenerationError;
use quill_core::session::GenerationMode;
use quill_engine::ModelScanner;
use quill_session::{ChatSession, SessionBuilder};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Args, Debug, Default)]
pub struct ChatArgs {
    /// Send a single message instead of entering interactive mode
    #[arg(short, long)]
    pub message: Option<String>,

    /// Model file to load (defaults to `model_path`, then the newest model in `models_dir`)
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Print each reply in one piece instead of streaming tokens
    #[arg(long = "static")]
    pub static_mode: bool,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub top_k: Option<u32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Number of past exchanges kept in the prompt
    #[arg(long)]
    pub history: Option<usize>,

    /// System prompt
    #[arg(long)]
    pub system: Option<String>,
}

pub async fn run(args: ChatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let engine = match quill_engine::build_from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!();
            eprintln!("  ERROR: {e}");
            eprintln!();
            eprintln!("  Build with local inference enabled:");
            eprintln!("    cargo install --path crates/cli --features local");
            eprintln!();
            return Err(e.into());
        }
    };

    let model_path = resolve_model(&config, args.model.as_deref()).ok_or_else(|| {
        format!(
            "No model found. Put a .gguf file in {} or pass --model <PATH>.",
            config.models_dir.display()
        )
    })?;

    let session = SessionBuilder::from_app_config(engine, &config).build()?;
    apply_overrides(&session, &args)?;

    eprint!("  Loading {}...", model_path.display());
    let info = session.load_model(&model_path).await;
    eprint!("\r\x1b[2K");
    let info = info?;

    if let Some(msg) = args.message {
        // Single message mode
        let result = reply(&session, &msg).await;
        session.release().await;
        result?;
        return Ok(());
    }

    // Interactive mode
    let config = session.config();
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        Quill Chat — Interactive Mode         ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Model:       {}", info.file_name());
    println!("  Mode:        {}", session.mode());
    println!(
        "  Sampling:    temperature {} · top_p {} · top_k {}",
        config.temperature, config.top_p, config.top_k
    );
    println!("  History:     {} exchanges", config.max_history_pairs);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Commands: /clear  /mode  /config  /help");
    println!("  Ctrl+C stops a reply; 'exit' or Ctrl+C at the prompt quits.");
    println!();

    let mut lines = stdin_lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.as_str() {
            "/clear" => {
                session.clear_history();
                println!("  History cleared.");
            }
            "/mode" => {
                let mode = session.toggle_mode();
                println!("  Mode: {mode}");
            }
            "/config" => print_config(&session),
            "/help" => {
                println!("  /clear   forget the conversation so far");
                println!("  /mode    switch between streaming and static replies");
                println!("  /config  show sampling settings");
                println!("  exit     quit");
            }
            input => {
                println!();
                print!("  Assistant > ");
                std::io::stdout().flush()?;
                if let Err(e) = reply(&session, input).await {
                    eprintln!("  [Error] {e}");
                }
            }
        }
        println!();
    }

    session.release().await;
    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Generate one reply, printing it to stdout. Ctrl+C cancels the reply.
async fn reply(session: &ChatSession, input: &str) -> Result<String, GenerationError> {
    let mode = session.mode();
    let generation = session.generate_with(input, |token| {
        print!("{token}");
        let _ = std::io::stdout().flush();
    });
    tokio::pin!(generation);

    let result = loop {
        tokio::select! {
            result = &mut generation => break result,
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
                eprint!(" [stopped]");
            }
        }
    };

    if let Ok(text) = &result
        && mode == GenerationMode::Static
    {
        print!("{text}");
    }
    println!();
    result
}

/// Explicit `--model`, then the configured `model_path`, then the newest
/// valid model in `models_dir`.
fn resolve_model(config: &AppConfig, explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| config.model_path.clone())
        .or_else(|| {
            ModelScanner::new(&config.models_dir)
                .first_valid()
                .map(|entry| entry.path)
        })
}

fn apply_overrides(session: &ChatSession, args: &ChatArgs) -> Result<(), GenerationError> {
    if args.static_mode {
        session.set_mode(GenerationMode::Static);
    }
    if let Some(t) = args.temperature {
        session.set_temperature(t)?;
    }
    if let Some(p) = args.top_p {
        session.set_top_p(p)?;
    }
    if let Some(k) = args.top_k {
        session.set_top_k(k)?;
    }
    if let Some(n) = args.max_tokens {
        session.set_max_tokens(n)?;
    }
    if let Some(n) = args.history {
        session.set_max_history_pairs(n)?;
    }
    if let Some(prompt) = &args.system {
        session.set_system_prompt(prompt.clone())?;
    }
    Ok(())
}

fn print_config(session: &ChatSession) {
    let config = session.config();
    println!("  Mode:         {}", session.mode());
    println!("  Temperature:  {}", config.temperature);
    println!("  Top-p:        {}", config.top_p);
    println!("  Top-k:        {}", config.top_k);
    println!("  Max tokens:   {}", config.max_tokens);
    println!(
        "  History:      {} of {} exchanges",
        session.history_len(),
        config.max_history_pairs
    );
    println!("  System:       {}", config.system_prompt);
}

/// Read non-empty stdin lines on a background task until EOF or an exit command.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut lines = BufReader::new(io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if matches!(line.as_str(), "exit" | "quit" | "/exit" | "/quit" | ":q") {
                        break;
                    }
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break, // EOF (Ctrl+D)
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });

    rx
}
