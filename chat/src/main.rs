use std::error::Error;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Sender};
use std::thread;

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use shmchat::session::signals::SignalListener;
use shmchat::{ChatConfig, ChatStore, Identity, MessageRecord, Session};

mod clock;

const QUIT_COMMANDS: [&str; 3] = ["/exit", "/quit", "/salir"];

#[derive(clap::Parser)]
#[clap(version, about = "Chat between terminals through a shared memory ring")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmchat.toml")]
    config: String,
    /// Join with this name instead of asking for one.
    #[clap(short = 'u', long = "user")]
    user: Option<String>,
    /// Remove the shared segment and gate from the system, then exit.
    #[clap(long = "purge")]
    purge: bool,
}

enum Event {
    Line(String),
    EndOfInput,
    Interrupted(i32),
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ChatConfig = confy::load_path(&opts.config)?;
    debug!(?cfg, "loaded configuration");

    if opts.purge {
        shmchat::remove_resources(&cfg.shmem)?;
        println!("Removed segment {:?} and gate {:#x}.", cfg.shmem.segment_name, cfg.shmem.gate_key);
        return Ok(());
    }

    println!("=== SHARED MEMORY CHAT ===");
    let store = match ChatStore::attach(&cfg.shmem) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Could not open the shared chat: {}", e);
            return Err(Box::new(e));
        }
    };

    let (events, inbox) = mpsc::channel::<Event>();
    spawn_stdin_reader(events.clone());

    let identity = match identify(opts.user.as_deref(), &inbox)? {
        Some(identity) => identity,
        None => {
            store.detach();
            return Ok(());
        }
    };

    // The first Ctrl-C only wakes up the input loop and shutdown runs below. A
    // second one ends the process with the default action.
    let signals = SignalListener::termination(move |signal| {
        let _ = events.send(Event::Interrupted(signal));
    })?;

    let mut session = Session::join(store, identity.clone(), &cfg)?;
    let prompt = format!("{}> ", identity);
    let render_prompt = prompt.clone();
    session.start_reader(move |message: &MessageRecord| render(message, &render_prompt))?;

    println!();
    println!("Connected as {}. Type your messages ({} or Ctrl+C to leave).", identity, QUIT_COMMANDS[0]);
    println!();

    loop {
        print!("{}", prompt);
        io::stdout().flush()?;
        match inbox.recv() {
            Ok(Event::Line(line)) => {
                if QUIT_COMMANDS.contains(&line.trim()) {
                    break;
                }
                session.submit(&line)?;
                if !session.reader_alive() {
                    warn!("incoming messages are no longer displayed; the reader stopped");
                }
            }
            Ok(Event::Interrupted(signal)) => {
                debug!(signal, "leaving on signal");
                break;
            }
            Ok(Event::EndOfInput) | Err(_) => break,
        }
    }

    session.shutdown()?;
    signals.close();
    println!();
    println!("Goodbye, {}!", identity);
    Ok(())
}

/// Asks for a name until a valid one is given. `None` if input ended first.
fn identify(
    preset: Option<&str>,
    inbox: &mpsc::Receiver<Event>,
) -> Result<Option<Identity>, Box<dyn Error>> {
    if let Some(name) = preset {
        return Ok(Some(Identity::new(name)?));
    }
    loop {
        print!("Enter your username: ");
        io::stdout().flush()?;
        match inbox.recv() {
            Ok(Event::Line(line)) => match Identity::new(&line) {
                Ok(identity) => return Ok(Some(identity)),
                Err(e) => println!("{}", e),
            },
            Ok(Event::EndOfInput) | Ok(Event::Interrupted(_)) | Err(_) => return Ok(None),
        }
    }
}

/// Forwards stdin lines as events. The thread ends with the input.
fn spawn_stdin_reader(events: Sender<Event>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("stdin: {}", e);
                    break;
                }
            };
            if events.send(Event::Line(line)).is_err() {
                return;
            }
        }
        let _ = events.send(Event::EndOfInput);
    });
}

fn render(message: &MessageRecord, prompt: &str) {
    let mut out = io::stdout().lock();
    // Clear the half-typed prompt line, print, and draw the prompt again.
    let _ = write!(
        out,
        "\r\x1b[K[{}] {}: {}\n{}",
        clock::hms(message.timestamp),
        message.author,
        message.text,
        prompt
    );
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn opts_default_to_local_config() {
        let opts = Opts::parse_from(["shmchat"]);
        assert_eq!(opts.config, "shmchat.toml");
        assert!(opts.user.is_none());
        assert!(!opts.purge);

        let opts = Opts::parse_from(["shmchat", "-c", "room.toml", "-u", "alice", "--purge"]);
        assert_eq!(opts.config, "room.toml");
        assert_eq!(opts.user.as_deref(), Some("alice"));
        assert!(opts.purge);
    }

    #[test]
    fn missing_config_file_is_written_with_defaults() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path: PathBuf = dir.path().join("shmchat.toml");
        let cfg: ChatConfig = confy::load_path(&path)?;
        assert_eq!(cfg, ChatConfig::default());
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn partial_config_file_keeps_other_defaults() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("room.toml");
        std::fs::write(&path, "poll_interval_ms = 50\n\n[shmem]\ncapacity = 8\n")?;
        let cfg: ChatConfig = confy::load_path(&path)?;
        assert_eq!(cfg.poll_interval_ms, 50);
        assert_eq!(cfg.shmem.capacity, 8);
        assert_eq!(cfg.shmem.gate_key, shmchat::core::DEFAULT_GATE_KEY);
        assert_eq!(cfg.shmem.segment_name, shmchat::core::DEFAULT_SEGMENT_NAME);
        Ok(())
    }

    #[test]
    fn identify_uses_preset_name_or_prompts() -> Result<(), Box<dyn Error>> {
        let (tx, rx) = mpsc::channel();
        assert_eq!(identify(Some(" bob "), &rx)?.unwrap().as_str(), "bob");

        tx.send(Event::Line("   ".to_string()))?;
        tx.send(Event::Line("carol".to_string()))?;
        assert_eq!(identify(None, &rx)?.unwrap().as_str(), "carol");

        tx.send(Event::EndOfInput)?;
        assert!(identify(None, &rx)?.is_none());
        Ok(())
    }
}
