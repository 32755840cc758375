//! phonon-studio CLI - live coding studio front end

use clap::{Parser, Subcommand};
use phonon_studio::catalog;
use phonon_studio::config::StudioConfig;
use phonon_studio::controller::Backend;
use phonon_studio::editor::{self, EditorState};
use phonon_studio::live;
use phonon_studio::pattern_engine::OscPatternEngine;
use phonon_studio::studio::{Studio, StudioHandle};
use phonon_studio::tone::ToneLibrary;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "phonon-studio")]
#[command(about = "Live coding studio for Tone-style snippets and patterns", long_about = None)]
struct Cli {
    /// Config file (default: $CONFIG_DIR/phonon-studio/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seconds before a running session stops automatically
    #[arg(short, long, global = true)]
    timeout: Option<f64>,

    /// Pattern tempo in cycles per second
    #[arg(long, global = true, conflicts_with = "cpm")]
    cps: Option<f64>,

    /// Pattern tempo in cycles per minute
    #[arg(long, global = true)]
    cpm: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the live coding editor
    Edit {
        /// Snippet file to load and save
        file: Option<PathBuf>,

        /// Backend to start with: tone or pattern
        #[arg(short, long)]
        backend: Option<Backend>,
    },

    /// Evaluate a snippet once and play until it stops
    Run {
        /// Snippet file, inline code, or - for stdin
        input: String,

        /// Backend: tone or pattern
        #[arg(short, long)]
        backend: Option<Backend>,
    },

    /// Re-evaluate a file every time it is saved
    Live {
        /// Snippet file to watch
        #[arg(default_value = "live.js")]
        file: PathBuf,

        /// Backend: tone or pattern
        #[arg(short, long)]
        backend: Option<Backend>,
    },

    /// List bundled examples
    Examples {
        /// Only show one category
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Print one bundled example
    Show {
        /// Example id, as listed by `examples`
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The editor owns the terminal, so its logs go to a file
    let log_path = match &cli.command {
        Commands::Edit { .. } => Some(log_file_path()),
        _ => None,
    };
    init_logging(log_path.as_deref())?;

    let mut config = StudioConfig::discover(cli.config.as_deref())?;
    if let Some(timeout) = cli.timeout {
        config.session.timeout_secs = timeout;
    }
    if let Some(cps) = cli.cps.or(cli.cpm.map(|cpm| cpm / 60.0)) {
        config.pattern.cps = Some(cps);
    }
    if cli.timeout.is_some() || config.pattern.cps.is_some() {
        config.validate()?;
    }

    match cli.command {
        Commands::Edit { file, backend } => {
            let backend = backend.unwrap_or(config.session.default_backend);
            let state = EditorState::open(file, backend)?
                .with_cps(config.pattern.cps.unwrap_or(editor::DEFAULT_CPS));
            let (studio, host) = spawn_studio(&config);

            let handle = studio.clone();
            let result = tokio::task::spawn_blocking(move || editor::run(handle, state)).await?;

            studio.shutdown();
            host.await?;
            result?;
        }

        Commands::Run { input, backend } => {
            let backend = backend.unwrap_or(config.session.default_backend);
            let code = read_input(&input)?;
            let (studio, host) = spawn_studio(&config);

            let outcome = studio.evaluate_with(backend, code).await;
            match &outcome {
                Ok(Some(session)) => {
                    println!(
                        "▶ Session {} on {} (stops after {:.1}s, Ctrl+C to stop now)",
                        session, backend, config.session.timeout_secs
                    );
                    tokio::select! {
                        _ = studio.wait_idle() => println!("⏹ Finished"),
                        _ = tokio::signal::ctrl_c() => {
                            studio.stop().await;
                            println!("⏹ Stopped");
                        }
                    }
                }
                Ok(None) => println!("Nothing to evaluate"),
                Err(_) => {}
            }

            studio.shutdown();
            host.await?;
            outcome?;
        }

        Commands::Live { file, backend } => {
            let backend = backend.unwrap_or(config.session.default_backend);
            if !file.exists() {
                let starter = catalog::all()
                    .iter()
                    .find(|e| e.backend == backend)
                    .map(|e| e.code())
                    .unwrap_or_default();
                std::fs::write(&file, format!("{}\n", starter))?;
                println!("Created {}", file.display());
            }

            let (studio, host) = spawn_studio(&config);
            println!("👀 Watching {}, save to re-evaluate (Ctrl+C to quit)", file.display());

            let watched = tokio::select! {
                result = live::run(&studio, &file, backend) => result,
                _ = tokio::signal::ctrl_c() => Ok(()),
            };

            studio.shutdown();
            host.await?;
            watched?;
        }

        Commands::Examples { category } => {
            let categories = match &category {
                Some(c) => vec![c.as_str()],
                None => catalog::categories(),
            };
            for name in categories {
                let examples = catalog::by_category(name);
                if examples.is_empty() {
                    return Err(format!("Unknown category '{}'", name).into());
                }
                println!("{}:", name);
                for example in examples {
                    println!("  {:22} [{:7}] {}", example.id, example.backend, example.title);
                }
            }
        }

        Commands::Show { id } => {
            let example =
                catalog::get(&id).ok_or_else(|| format!("Unknown example '{}'", id))?;
            println!("// {} ({})", example.title, example.backend);
            println!("// {}", example.description);
            println!("{}", example.code());
        }
    }

    Ok(())
}

fn spawn_studio(config: &StudioConfig) -> (StudioHandle, JoinHandle<()>) {
    let audio = Arc::new(ToneLibrary::new(config.tone.clone()));
    let pattern = Arc::new(OscPatternEngine::new(config.pattern.clone()));
    Studio::spawn(audio, pattern, config)
}

/// File path, `-` for stdin, or the code itself
fn read_input(input: &str) -> Result<String, Box<dyn std::error::Error>> {
    if input == "-" {
        let mut code = String::new();
        std::io::stdin().read_to_string(&mut code)?;
        return Ok(code);
    }
    let path = Path::new(input);
    if path.is_file() {
        return Ok(std::fs::read_to_string(path)?);
    }
    Ok(input.to_string())
}

fn log_file_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("phonon-studio")
        .join("studio.log")
}

fn init_logging(file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(log))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}
