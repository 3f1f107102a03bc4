//! icyplay CLI - line-oriented internet radio player
//!
//! Plays the URL given on the command line, then reads commands from stdin
//! (`play`, `stop`, `vol`, `status`, `meter`, `quit`) while printing player
//! events as they arrive.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{select, unbounded, Receiver};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use icyplay::config::PlayerConfig;
use icyplay::error::PlayerError;
use icyplay::session::{PlayerEvent, PlayerState, SessionController, SessionStatus};
use icyplay::stream::StreamDescriptor;

#[derive(Parser)]
#[command(name = "icyplay", about = "Terminal internet radio player", version)]
struct Cli {
    /// Stream URL to play on startup
    url: Option<String>,

    /// Display name for the startup stream
    #[arg(short, long)]
    title: Option<String>,

    /// Initial volume in percent (0-100)
    #[arg(short, long)]
    volume: Option<u8>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

enum Command {
    Play { url: String, title: Option<String> },
    Stop,
    Volume(u8),
    Status,
    Meter,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let command = match verb {
        "play" | "p" => match parts.next() {
            Some(url) => {
                let title: Vec<&str> = parts.collect();
                Command::Play {
                    url: url.to_string(),
                    title: (!title.is_empty()).then(|| title.join(" ")),
                }
            }
            None => Command::Unknown("play needs a URL".to_string()),
        },
        "stop" | "s" => Command::Stop,
        "vol" | "v" => match parts.next().and_then(|v| v.parse::<u8>().ok()) {
            Some(v) if v <= 100 => Command::Volume(v),
            _ => Command::Unknown("vol takes 0-100".to_string()),
        },
        "status" | "st" => Command::Status,
        "meter" | "m" => Command::Meter,
        "help" | "h" | "?" => Command::Help,
        "quit" | "q" | "exit" => Command::Quit,
        other => Command::Unknown(format!("unknown command: {}", other)),
    };
    Some(command)
}

fn load_config(path: Option<&PathBuf>) -> Result<PlayerConfig, PlayerError> {
    let Some(path) = path else {
        return Ok(PlayerConfig::default());
    };
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| PlayerError::Config(format!("{}: {}", path.display(), e)))
}

/// Forward stdin lines on a channel; closes on EOF
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .ok();
    rx
}

fn descriptor_for(url: &str, title: Option<String>) -> StreamDescriptor {
    StreamDescriptor::new(title.unwrap_or_else(|| url.to_string()), url)
}

fn print_event(event: &PlayerEvent) {
    match event {
        PlayerEvent::SessionStarted { token, descriptor } => {
            println!("[{}] connecting to {} ({})", token, descriptor.title, descriptor.url)
        }
        PlayerEvent::Connected {
            token,
            content_type,
            tags,
            decoded,
        } => {
            let path = if *decoded { "decoded" } else { "direct" };
            println!(
                "[{}] connected: {} ({})",
                token,
                content_type.as_deref().unwrap_or("unknown type"),
                path
            );
            for (key, value) in tags.displayable() {
                println!("      {:<12} {}", key, value);
            }
        }
        PlayerEvent::TitleChanged { token, title } => {
            match (&title.artist, &title.title) {
                (Some(artist), Some(song)) => println!("[{}] now playing: {} / {}", token, artist, song),
                _ => println!("[{}] now playing: {}", token, title.raw),
            }
        }
        PlayerEvent::FormatProbed { token, format } => println!("[{}] format: {}", token, format),
        PlayerEvent::SessionFailed { token, error } => println!("[{}] failed: {}", token, error),
        PlayerEvent::StreamEnded { token, report } => println!(
            "[{}] stream ended ({} chunks, {} decode errors)",
            token, report.chunks_read, report.decode_errors
        ),
        PlayerEvent::SessionCancelled { token } => println!("[{}] stopped", token),
        PlayerEvent::StatsUpdated { .. } => {}
    }
}

fn print_status(state: &PlayerState, volume: f32) {
    let status = match state.status {
        SessionStatus::Idle => "idle",
        SessionStatus::Connecting => "connecting",
        SessionStatus::Playing => "playing",
        SessionStatus::Ended => "ended",
        SessionStatus::Failed => "failed",
    };
    println!("status:   {} (session {})", status, state.token);
    if let Some(ref stream) = state.now_playing {
        println!("station:  {} ({})", stream.title, stream.url);
    }
    if let Some(name) = state.tags.station_name() {
        println!("name:     {}", name);
    }
    if let Some(ref title) = state.title {
        println!("title:    {}", title.raw);
    }
    match state.format {
        Some(ref format) => println!("format:   {}", format),
        None if state.active => println!("format:   loading"),
        None => {}
    }
    if let Some(ref stats) = state.stats {
        println!(
            "received: {} KiB ({:.0} kbps)",
            stats.total_bytes_read / 1024,
            stats.bitrate_kbps()
        );
    }
    if state.pump.chunks_read > 0 {
        println!(
            "pump:     {} chunks, {} scheduled, {} decode errors",
            state.pump.chunks_read, state.pump.buffers_scheduled, state.pump.decode_errors
        );
    }
    if let Some(ref error) = state.error {
        println!("error:    {}", error);
    }
    println!("volume:   {:.0}%", volume * 100.0);
}

fn print_meter(player: &SessionController) {
    let analysis = player.analysis();
    let a = analysis.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let bar = |v: f32| "#".repeat((v.clamp(0.0, 1.0) * 30.0) as usize);
    println!("L {}", bar(a.vu_left));
    println!("R {}", bar(a.vu_right));
    let bands: String = a
        .spectrum
        .iter()
        .map(|&v| match (v * 4.0) as u8 {
            0 => ' ',
            1 => '.',
            2 => ':',
            3 => '|',
            _ => '#',
        })
        .collect();
    println!("[{}]", bands);
}

fn print_help() {
    println!("commands:");
    println!("  play <url> [title]  switch to a stream");
    println!("  stop                stop playback");
    println!("  vol <0-100>         set volume");
    println!("  status              show the current session");
    println!("  meter               show levels and spectrum");
    println!("  quit                exit");
}

/// Filter from `RUST_LOG` directives, falling back to `icyplay=info` when
/// they are missing or malformed.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("icyplay=info"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .with_writer(io::stderr)
        .init();

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(volume) = cli.volume {
        config.volume = f32::from(volume.min(100)) / 100.0;
    }

    let player = match SessionController::with_config(config) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Failed to start the player");
            std::process::exit(1);
        }
    };
    debug!(volume = player.volume(), "player ready");
    let events = player.subscribe();
    let commands = spawn_stdin_reader();

    if let Some(url) = cli.url {
        player.start(descriptor_for(&url, cli.title))?;
    } else {
        print_help();
    }

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => print_event(&event),
                Err(_) => break,
            },
            recv(commands) -> line => {
                let Ok(line) = line else { break };
                let Some(command) = parse_command(&line) else { continue };
                match command {
                    Command::Play { url, title } => {
                        if let Err(e) = player.start(descriptor_for(&url, title)) {
                            warn!(url = %url, error = %e, "Could not start stream");
                        }
                    }
                    Command::Stop => {
                        if let Err(e) = player.cancel() {
                            warn!(error = %e, "Could not stop playback");
                        }
                    }
                    Command::Volume(v) => {
                        let applied = player.set_volume(f32::from(v) / 100.0);
                        println!("volume {:.0}%", applied * 100.0);
                    }
                    Command::Status => print_status(&player.snapshot(), player.volume()),
                    Command::Meter => print_meter(&player),
                    Command::Help => print_help(),
                    Command::Quit => break,
                    Command::Unknown(msg) => eprintln!("{} (try 'help')", msg),
                }
            },
            default(Duration::from_millis(250)) => {}
        }
        io::stdout().flush().ok();
    }

    info!("shutting down");
    player.shutdown()?;
    Ok(())
}
