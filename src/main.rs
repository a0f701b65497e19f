use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use lotus_avatar::conversation::ConversationEvent;
use lotus_avatar::speech::{VisemeMapper, segment};
use lotus_avatar::{Avatar, Config, ConversationSession, OpenAiClient, ScriptedRecognizer};

/// Lotus - speech and lip-sync core for a conversational avatar
#[derive(Parser)]
#[command(name = "lotus", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show how text is split into speakable chunks
    Segment {
        /// Text to segment
        text: String,
    },
    /// Print the viseme timeline for text
    Visemes {
        /// Text to analyze
        text: String,
        /// Speech rate multiplier
        #[arg(short, long, default_value = "1.0")]
        rate: f32,
        /// Seed for reproducible jitter
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Speak text through the simulated engine, logging mouth shapes
    Say {
        /// Text to speak
        text: String,
    },
    /// Chat with the configured completion endpoint from stdin
    Chat {
        /// Gate input behind the wake phrase
        #[arg(long)]
        wake: bool,
    },
    /// Show live microphone levels
    #[cfg(feature = "microphone")]
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,lotus_avatar=info",
        1 => "info,lotus_avatar=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Segment { text } => {
            print_segments(&text);
            Ok(())
        }
        Command::Visemes { text, rate, seed } => {
            print_visemes(&text, rate, seed);
            Ok(())
        }
        Command::Say { text } => say(&text).await,
        Command::Chat { wake } => chat(wake).await,
        #[cfg(feature = "microphone")]
        Command::TestMic { duration } => test_mic(duration).await,
    }
}

fn print_segments(text: &str) {
    let mut remaining = text.to_string();
    let mut pass = 1;
    loop {
        let result = segment(&remaining);
        if !result.has_ready() {
            break;
        }
        println!("[{pass}] {}", result.ready_text);
        remaining = result.remaining_text;
        pass += 1;
    }
    if !remaining.trim().is_empty() {
        println!("[rest] {}", remaining.trim());
    }
}

fn print_visemes(text: &str, rate: f32, seed: Option<u64>) {
    let mut mapper = seed.map_or_else(VisemeMapper::new, VisemeMapper::with_seed);
    let timeline = mapper.analyze(text, rate);

    let mut elapsed = 0;
    for frame in &timeline {
        let ms = frame.duration.as_millis();
        println!("{elapsed:>6} ms  {:<12} {ms:>4} ms", frame.viseme.as_str());
        elapsed += ms;
    }
    println!("---");
    println!("{} frames, {} ms", timeline.len(), timeline.total_duration().as_millis());
}

async fn say(text: &str) -> anyhow::Result<()> {
    let avatar = Avatar::builder(Config::load()?).build()?;

    let mut visemes = avatar.signal().subscribe_viseme();
    let printer = tokio::spawn(async move {
        while visemes.changed().await.is_ok() {
            let viseme = *visemes.borrow_and_update();
            tracing::info!(viseme = viseme.as_str(), "mouth");
        }
    });

    let ticket = avatar.say(text);
    if let Some(result) = avatar.until_interrupted(ticket, tokio::signal::ctrl_c()).await {
        result?;
    }

    printer.abort();
    Ok(())
}

async fn chat(wake: bool) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    let client = Arc::new(OpenAiClient::new(
        &config.completion.base_url,
        config.completion.model.clone(),
        config.completion.api_key.take(),
    )?);
    let store = Arc::new(config.preference_store());
    let recognizer = ScriptedRecognizer::new();

    let builder = Avatar::builder(config)
        .recognizer(Arc::new(recognizer.clone()))
        .preferences(store);
    #[cfg(feature = "microphone")]
    let builder = if wake {
        builder.microphone(Arc::new(lotus_avatar::voice::CpalMicrophone::new()))
    } else {
        builder
    };
    let avatar = builder.build()?;
    let session = Arc::new(avatar.session(client));

    let mut events = avatar.orchestrator().subscribe();
    if wake {
        avatar.orchestrator().start_conversation_mode().await?;
        println!(
            "Say \"{}\" to begin, \"{}\" to finish. Ctrl-C stops speech and exits.",
            avatar.config().wake.activation_phrase,
            avatar.config().wake.deactivation_phrase
        );
    } else {
        println!("Type a message. Ctrl-C stops speech and exits.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                avatar.emergency_stop();
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if wake {
                    if !recognizer.inject_final(line) {
                        println!("(not listening yet, try again in a moment)");
                    }
                } else if avatar
                    .until_interrupted(reply(&session, line), tokio::signal::ctrl_c())
                    .await
                    .is_none()
                {
                    break;
                }
            }
            event = events.recv(), if wake => match event {
                Ok(ConversationEvent::UserQuery { text }) => {
                    let session = Arc::clone(&session);
                    tokio::spawn(async move { reply(&session, &text).await });
                }
                Ok(ConversationEvent::Error { message }) => eprintln!("error: {message}"),
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    avatar.shutdown().await;
    Ok(())
}

async fn reply(session: &ConversationSession, text: &str) {
    match session.respond(text).await {
        Ok(reply) => {
            println!("lotus: {}", reply.text);
            if let Err(e) = reply.completion.wait().await {
                tracing::warn!(error = %e, "speech failed");
            }
        }
        Err(e) => eprintln!("error: {e}"),
    }
}

/// Show live microphone levels
#[cfg(feature = "microphone")]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    use std::time::Duration;

    use lotus_avatar::voice::{CpalMicrophone, Microphone, VadConfig};

    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let threshold = VadConfig::default().threshold;
    let mut meter = CpalMicrophone::new().open().await?;
    let ticks = duration * 4;
    for i in 0..ticks {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let level = meter.level();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 50.0).clamp(0.0, 50.0) as usize;
        let bar: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let marker = if level > threshold { "speech" } else { "" };

        #[allow(clippy::cast_precision_loss)]
        let secs = (i + 1) as f32 / 4.0;
        println!("[{secs:5.2}s] level: {level:.3} | [{bar}] {marker}");
    }
    meter.close();

    println!("\n---");
    println!("If the meter moved while you spoke, your mic is working!");
    Ok(())
}
