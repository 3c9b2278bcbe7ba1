use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use live_voice::credentials::{self, mask_key, ApiKey, API_KEY_ENV};
use live_voice::preview::{write_wav, VoicePreviewClient, PREBUILT_VOICES};
use live_voice::settings::{default_settings_path, load_settings, save_settings};
use live_voice::{AppSettings, PersonaConfig, SessionSnapshot, Status};

#[derive(Parser)]
#[command(name = "live-voice", version, about = "Real-time voice sessions with Gemini Live")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, env = "LIVE_VOICE_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a live voice session. Typed lines are sent as text;
    /// /stop, /start and /quit control the session.
    Live {
        /// Persona JSON file ({"id", "name", "prompt", "voice"})
        #[arg(long)]
        persona: Option<PathBuf>,
        /// Prebuilt voice, overriding persona and settings
        #[arg(long)]
        voice: Option<String>,
        /// Post finalized user turns to the coaching backend
        #[arg(long)]
        coaching: bool,
    },
    /// Speak a sample sentence with a prebuilt voice and save it as WAV
    PreviewVoice {
        #[arg(long)]
        voice: Option<String>,
        #[arg(long, default_value = "Hello! This is how I sound.")]
        text: String,
        #[arg(short, long, default_value = "preview.wav")]
        output: PathBuf,
        /// List prebuilt voices and exit
        #[arg(long)]
        list: bool,
    },
    /// Talk to the coaching backend without a live session
    Coach {
        /// Utterance to get feedback on
        text: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Print learning progress
        #[arg(long)]
        progress: bool,
        /// List coaching personas
        #[arg(long)]
        personas: bool,
    },
    /// Manage the stored API key override
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Store a key (read from stdin when omitted)
    Set { key: Option<String> },
    Clear,
    /// Show which key would be used, masked
    Show,
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Path,
    /// Change one setting and save, e.g. `set recycle_secs 300`
    Set { key: String, value: String },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Both tungstenite and reqwest use rustls; pick the provider once
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let settings_path = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let settings = load_settings(&settings_path);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Command::Live {
            persona,
            voice,
            coaching,
        } => {
            let mut persona = match persona {
                Some(path) => load_persona(&path)?,
                None => PersonaConfig::default(),
            };
            if let Some(voice) = voice {
                persona = persona.with_voice(voice);
            }
            let mut settings = settings;
            settings.coaching_enabled |= coaching;

            let key = require_api_key()?;
            runtime.block_on(run_live(settings, persona, key))
        }
        Command::PreviewVoice {
            voice,
            text,
            output,
            list,
        } => {
            if list {
                for voice in PREBUILT_VOICES {
                    println!("{}", voice);
                }
                return Ok(());
            }
            let voice = voice.unwrap_or_else(|| settings.voice.clone());
            if !PREBUILT_VOICES.contains(&voice.as_str()) {
                log::warn!("'{}' is not a known prebuilt voice, trying anyway", voice);
            }
            let key = require_api_key()?;
            runtime.block_on(preview_voice(&settings, &key, &voice, &text, &output))
        }
        Command::Coach {
            text,
            session,
            progress,
            personas,
        } => runtime.block_on(coach(&settings, text, session, progress, personas)),
        Command::Credential { action } => credential(action),
        Command::Settings { action } => {
            match action {
                SettingsAction::Path => println!("{}", settings_path.display()),
                SettingsAction::Show => println!("{}", serde_json::to_string_pretty(&settings)?),
                SettingsAction::Set { key, value } => {
                    let mut settings = settings;
                    settings.set_field(&key, &value)?;
                    save_settings(&settings_path, &settings)?;
                    println!("{} updated in {}", key, settings_path.display());
                }
            }
            Ok(())
        }
    }
}

fn load_persona(path: &Path) -> anyhow::Result<PersonaConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read persona {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse persona {}", path.display()))
}

fn require_api_key() -> anyhow::Result<ApiKey> {
    match credentials::resolve_api_key() {
        Some(key) => {
            log::info!("Using API key from {}", key.source.describe());
            Ok(key)
        }
        None => bail!(
            "No API key configured. Set {} or run `live-voice credential set`.",
            API_KEY_ENV
        ),
    }
}

#[cfg(feature = "device-audio")]
async fn run_live(settings: AppSettings, persona: PersonaConfig, key: ApiKey) -> anyhow::Result<()> {
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use live_voice::audio::device::{CpalMicrophone, CpalOutput};
    use live_voice::guard::InhibitWakeLock;
    use live_voice::live::WsTransport;
    use live_voice::{Collaborators, LiveEffectRunner, SessionController};

    let collaborators = Collaborators {
        transport: Arc::new(WsTransport::new(settings.proxy())),
        microphone: Arc::new(CpalMicrophone),
        output: Arc::new(CpalOutput),
        wake_lock: Arc::new(InhibitWakeLock::default()),
        coaching: settings.coaching_client(),
    };
    let runner = LiveEffectRunner::new(collaborators, settings.runner_config(key.value));
    let controller = SessionController::spawn(runner, settings.session_options());
    let printer = tokio::spawn(print_updates(controller.state()));

    controller.start(persona.clone()).await?;
    eprintln!("Session starting. Type to send text; /stop, /start, /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let result = match line.trim() {
            "" => Ok(()),
            "/quit" => break,
            "/stop" => controller.stop().await,
            "/start" => controller.start(persona.clone()).await,
            text => controller.send_text(text).await,
        };
        if let Err(e) = result {
            eprintln!("{}", e);
        }
    }

    controller.shutdown().await?;
    printer.abort();
    Ok(())
}

#[cfg(not(feature = "device-audio"))]
async fn run_live(_: AppSettings, _: PersonaConfig, _: ApiKey) -> anyhow::Result<()> {
    bail!("Built without audio devices. Rebuild with `--features device-audio`.")
}

/// Print status changes and finalized transcript entries
#[cfg_attr(not(feature = "device-audio"), allow(dead_code))]
async fn print_updates(mut state: watch::Receiver<SessionSnapshot>) {
    let mut last_status: Option<Status> = None;
    let mut printed: HashSet<u64> = HashSet::new();
    let mut coached: HashSet<u64> = HashSet::new();

    while state.changed().await.is_ok() {
        let snapshot = state.borrow_and_update().clone();

        if last_status != Some(snapshot.status) {
            eprintln!("[{}]", snapshot.status.as_str());
            if snapshot.status == Status::Error {
                if let Some(err) = &snapshot.last_error {
                    eprintln!("error: {}", err);
                }
            }
            last_status = Some(snapshot.status);
        }

        for entry in snapshot.transcript.iter().filter(|e| e.is_final) {
            if printed.insert(entry.id) {
                println!("{}: {}", entry.speaker.label(), entry.text);
            }
            if let Some(feedback) = &entry.coaching {
                if coached.insert(entry.id) {
                    println!("  coach: {}", feedback.display_text());
                }
            }
        }
    }
}

async fn preview_voice(
    settings: &AppSettings,
    key: &ApiKey,
    voice: &str,
    text: &str,
    output: &Path,
) -> anyhow::Result<()> {
    let client = VoicePreviewClient::new(key.value.clone(), settings.preview_model.clone());
    let audio = client.synthesize(voice, text).await?;
    write_wav(output, &audio)?;
    println!(
        "Saved {:.1}s of '{}' to {}",
        audio.duration().as_secs_f32(),
        voice,
        output.display()
    );
    Ok(())
}

async fn coach(
    settings: &AppSettings,
    text: Option<String>,
    session: Option<String>,
    progress: bool,
    personas: bool,
) -> anyhow::Result<()> {
    let client = live_voice::coaching::CoachingClient::new(
        settings.coaching_url.clone(),
        settings.coaching_user_id.clone(),
    );

    let health = client.health().await?;
    if !health.is_healthy() {
        log::warn!("Coaching backend reports status '{}'", health.status);
    }

    if personas {
        for persona in client.personas().await? {
            println!(
                "{:<16} {}{}",
                persona.id,
                persona.name,
                persona
                    .description
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            );
        }
    }

    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
        let session_id = match session.clone() {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                client.start_session(&id, None).await?;
                id
            }
        };
        let feedback = client.utterance(&session_id, text.trim()).await?;
        println!("{}", feedback.display_text());
        for action in &feedback.next_actions {
            println!("  - {}", action);
        }
    }

    if progress {
        let report = client.progress(session.as_deref()).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn credential(action: CredentialAction) -> anyhow::Result<()> {
    match action {
        CredentialAction::Set { key } => {
            let key = match key {
                Some(key) => key,
                None => {
                    eprint!("API key: ");
                    std::io::stderr().flush()?;
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line)?;
                    line
                }
            };
            if key.trim().is_empty() {
                bail!("Empty key, nothing stored");
            }
            credentials::set_api_key_override(Some(&key))?;
            println!("Stored API key override {}", mask_key(key.trim()));
        }
        CredentialAction::Clear => {
            credentials::set_api_key_override(None)?;
            println!("API key override cleared");
        }
        CredentialAction::Show => match credentials::resolve_api_key() {
            Some(key) => println!("{} (from {})", mask_key(&key.value), key.source.describe()),
            None => println!("No API key configured"),
        },
    }
    Ok(())
}
