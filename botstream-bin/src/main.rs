use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use botstream_core::{
    config::Config,
    model::{ChatMessage, ChatRequest},
    Bot,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "botstream CLI smoke tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one chat turn to a bot
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "Stream the answer (prints deltas live)")]
        stream: bool,
        #[arg(long, help = "Config file (JSON or TOML)")]
        config: Option<PathBuf>,
        #[arg(long, env = "COZE_BOT_ID", help = "Bot id when no config file is given")]
        bot_id: Option<String>,
        #[arg(
            long,
            default_value_t = 600,
            help = "Give up waiting for the result after this many seconds"
        )]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Chat {
            message,
            stream,
            config,
            bot_id,
            timeout_secs,
        } => {
            let cfg = match (config, bot_id) {
                (Some(path), _) => Config::from_path(path)?,
                (None, Some(id)) => Config::new(id),
                (None, None) => anyhow::bail!("either --config or --bot-id is required"),
            };
            let bot = Bot::from_config(&cfg)?;
            let req = ChatRequest {
                additional_messages: vec![ChatMessage::user_text(message)],
                stream,
                ..Default::default()
            };

            let turn = bot.chat(req).await?;
            eprintln!(
                "[conversation: {} chat: {}]",
                turn.conversation_id().unwrap_or("-"),
                turn.chat_id().unwrap_or("-")
            );

            if stream {
                let mut events = turn.stream();
                let mut saw_delta = false;
                while let Some(ev) = events.next().await {
                    if let Some(txt) = ev.as_text_delta() {
                        saw_delta = true;
                        print!("{}", txt);
                        io::stdout().flush().ok();
                    }
                }
                if saw_delta {
                    println!();
                }
            }

            let res = turn.result_within(Duration::from_secs(timeout_secs)).await;
            if let Some(err) = &res.last_error {
                eprintln!("[error: {}]", err);
            }
            if !stream && !res.answer.is_empty() {
                println!("{}", res.answer);
            }
            for q in &res.follow_up {
                eprintln!("[follow up: {}]", q);
            }
            if let Some(usage) = res.usage {
                eprintln!(
                    "[tokens: in={} out={} total={}]",
                    usage.input_count, usage.output_count, usage.token_count
                );
            }
            if let Some(outcome) = turn.join().await {
                eprintln!("[outcome: {}]", outcome.as_str());
            }
        }
    }

    Ok(())
}
