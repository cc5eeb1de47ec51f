//! Studyvoice command-line host.
//!
//! ```text
//! studyvoice talk [--context <file>]
//! studyvoice say <text> [--language <lang>] [--rate <r>]
//! studyvoice ask <question> [--context <file>]
//! studyvoice devices
//! ```

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use settings::{
    apply_runtime_env_from_settings, default_settings_path, load_settings, save_settings,
    AppSettings,
};
use studyvoice_core::{
    audio::device::list_devices, AudioOutputService, GeminiConnector, GeminiRestClient,
    GenerationService, LiveConfig, LiveSessionController, OutputConfig, RestConfig,
    SessionObserver, SpeechPlayer, VoiceError,
};
use tokio::sync::{oneshot, Notify};
use tracing::{info, warn};

const USAGE: &str = "Usage:
  studyvoice talk [--context <file>]
  studyvoice say <text> [--language <lang>] [--rate <r>]
  studyvoice ask <question> [--context <file>]
  studyvoice devices";

#[derive(Debug, PartialEq)]
enum Command {
    Talk { context: Option<PathBuf> },
    Say { text: String, language: Option<String>, rate: Option<f64> },
    Ask { question: String, context: Option<PathBuf> },
    Devices,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, String> {
    let mut it = args.into_iter();
    let Some(command) = it.next() else {
        return Err("missing command".into());
    };

    let mut positional: Vec<String> = Vec::new();
    let mut context: Option<PathBuf> = None;
    let mut language: Option<String> = None;
    let mut rate: Option<f64> = None;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--context" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --context".into());
                };
                context = Some(PathBuf::from(v));
            }
            "--language" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --language".into());
                };
                language = Some(v);
            }
            "--rate" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --rate".into());
                };
                let parsed = v
                    .parse::<f64>()
                    .map_err(|_| "invalid value for --rate".to_string())?;
                if !(parsed.is_finite() && parsed > 0.0) {
                    return Err("--rate must be positive".into());
                }
                rate = Some(parsed);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument: {other}"));
            }
            _ => positional.push(arg),
        }
    }

    match command.as_str() {
        "talk" => Ok(Command::Talk { context }),
        "say" => {
            if positional.is_empty() {
                return Err("say needs the text to speak".into());
            }
            Ok(Command::Say {
                text: positional.join(" "),
                language,
                rate,
            })
        }
        "ask" => {
            if positional.is_empty() {
                return Err("ask needs a question".into());
            }
            Ok(Command::Ask {
                question: positional.join(" "),
                context,
            })
        }
        "devices" => Ok(Command::Devices),
        other => Err(format!("unknown command: {other}")),
    }
}

fn read_context(path: Option<&PathBuf>) -> anyhow::Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("failed to read context file {}", p.display())),
        None => Ok(String::new()),
    }
}

fn stamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Prints the conversation to stdout.
struct ConsoleObserver {
    context: String,
    closed: Notify,
}

impl SessionObserver for ConsoleObserver {
    fn on_user_transcript(&self, text: &str) {
        tracing::debug!(len = text.len(), "user transcript");
    }

    fn on_ai_transcript(&self, text: &str) {
        tracing::debug!(len = text.len(), "model transcript");
    }

    fn on_turn_complete(&self, user: &str, ai: &str) {
        if !user.is_empty() {
            println!("[{}] you: {user}", stamp());
        }
        if !ai.is_empty() {
            println!("[{}] tutor: {ai}", stamp());
        }
    }

    fn on_error(&self, error: &VoiceError) {
        eprintln!("[{}] error: {error}", stamp());
    }

    fn on_close(&self) {
        println!("[{}] conversation closed", stamp());
        self.closed.notify_one();
    }

    fn context(&self) -> String {
        self.context.clone()
    }
}

async fn talk(settings: &AppSettings, context: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = LiveConfig::default();
    config.apply_env();
    let connector = GeminiConnector::from_config(&config)?;
    let output = AudioOutputService::acquire(OutputConfig {
        preferred_device: settings.preferred_output_device.clone(),
        ..OutputConfig::default()
    })?;

    let observer = Arc::new(ConsoleObserver {
        context: read_context(context.as_ref())?,
        closed: Notify::new(),
    });
    let controller = LiveSessionController::new(config, connector, output.clone());
    let mut status = controller.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            info!(status = ?event.status, detail = ?event.detail, "session status");
        }
    });

    let handle = controller.start(Arc::clone(&observer) as Arc<dyn SessionObserver>).await?;
    println!("[{}] listening, press Ctrl+C to stop", stamp());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("failed to listen for Ctrl+C: {e}");
            }
            handle.close();
        }
        _ = observer.closed.notified() => {}
    }
    handle.join().await;

    let diag = controller.diagnostics();
    info!(
        messages_in = diag.messages_in,
        audio_chunks = diag.audio_chunks,
        decode_errors = diag.decode_errors,
        blocks_sent = diag.blocks_sent,
        blocks_dropped = diag.blocks_dropped,
        "session finished"
    );
    output.release();
    Ok(())
}

async fn say(
    settings: &AppSettings,
    text: &str,
    language: Option<String>,
    rate: Option<f64>,
) -> anyhow::Result<()> {
    let mut rest = RestConfig::default();
    rest.apply_env();
    let client = GeminiRestClient::new(rest)?;
    let output = AudioOutputService::acquire(OutputConfig {
        preferred_device: settings.preferred_output_device.clone(),
        ..OutputConfig::default()
    })?;
    let player = SpeechPlayer::new(client, output.clone());

    let language = language.unwrap_or_else(|| settings.speech_language.clone());
    let rate = rate.unwrap_or(settings.speech_rate);
    let (done_tx, done_rx) = oneshot::channel();
    let played = player
        .speak(text, &language, rate, move || {
            let _ = done_tx.send(());
        })
        .await?;
    if played {
        tokio::select! {
            _ = done_rx => {}
            _ = tokio::signal::ctrl_c() => player.stop(),
        }
    }
    output.release();
    Ok(())
}

async fn ask(question: &str, context: Option<PathBuf>) -> anyhow::Result<()> {
    let mut rest = RestConfig::default();
    rest.apply_env();
    let client = GeminiRestClient::new(rest)?;
    let context = read_context(context.as_ref())?;
    let answer = client.generate(question, &context).await?;
    println!("{answer}");
    Ok(())
}

fn devices() {
    for device in list_devices() {
        println!(
            "{:<6} {}{}{}",
            format!("{:?}", device.direction).to_lowercase(),
            device.name,
            if device.is_default { " (default)" } else { "" },
            if device.is_loopback_like { " [loopback]" } else { "" },
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studyvoice=info,studyvoice_core=info".into()),
        )
        .init();

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("a TLS crypto provider was already installed");
    }

    let settings_path = default_settings_path();
    let app_settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &app_settings) {
            warn!(path = ?settings_path, "failed to write default settings: {e}");
        }
    }
    apply_runtime_env_from_settings(&app_settings);
    info!(
        settings_path = ?settings_path,
        live_model = %app_settings.live_model,
        live_voice = %app_settings.live_voice,
        "runtime settings loaded"
    );

    match command {
        Command::Talk { context } => talk(&app_settings, context).await,
        Command::Say { text, language, rate } => say(&app_settings, &text, language, rate).await,
        Command::Ask { question, context } => ask(&question, context).await,
        Command::Devices => {
            devices();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn say_joins_words_and_reads_options() {
        let cmd = parse_args(args(&["say", "buenos", "días", "--language", "Spanish", "--rate", "1.5"]))
            .unwrap();
        assert_eq!(
            cmd,
            Command::Say {
                text: "buenos días".into(),
                language: Some("Spanish".into()),
                rate: Some(1.5),
            }
        );
    }

    #[test]
    fn talk_takes_an_optional_context_file() {
        assert_eq!(parse_args(args(&["talk"])).unwrap(), Command::Talk { context: None });
        assert_eq!(
            parse_args(args(&["talk", "--context", "notes.md"])).unwrap(),
            Command::Talk {
                context: Some(PathBuf::from("notes.md"))
            }
        );
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["say"])).is_err());
        assert!(parse_args(args(&["say", "hi", "--rate", "0"])).is_err());
        assert!(parse_args(args(&["talk", "--context"])).is_err());
        assert!(parse_args(args(&["dance"])).is_err());
        assert!(parse_args(args(&["devices", "--verbose"])).is_err());
    }
}
