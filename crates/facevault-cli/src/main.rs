use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facevault_core::{
    ArcFaceExtractor, EngineConfig, EngineHandle, EnrollmentStore, FileKvStore, FullFrameDetector,
    IdentityId, IdentitySummary, SessionController, VerificationOutcome,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

mod capture;

use capture::StagedImageCapture;

#[derive(Parser)]
#[command(name = "facevault", about = "Face enrollment and verification")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from a portrait image
    Enroll {
        /// Name to enroll the face under
        #[arg(short, long)]
        label: String,
        /// Portrait image containing the face
        #[arg(short, long)]
        image: PathBuf,
        /// Add to the existing identity with this label instead of creating a new one
        #[arg(long)]
        multi_shot: bool,
    },
    /// Verify a portrait image against the enrolled faces
    Verify {
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Interactive session with a persistent engine
    Shell,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("load configuration")?;

    match cli.command {
        Commands::Enroll {
            label,
            image,
            multi_shot,
        } => {
            let (engine, capture) = build_engine(&config)?;
            let id = enroll(&engine, &capture, &label, &image, multi_shot).await?;
            println!("Enrolled {label} ({id})");
        }
        Commands::Verify { image } => {
            let (engine, capture) = build_engine(&config)?;
            let outcome = verify(&engine, &capture, &image).await?;
            print_outcome(&outcome);
            if !outcome.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::List => {
            let store = open_store(&config)?;
            print_identities(&store.list());
        }
        Commands::Remove { id } => {
            let store = open_store(&config)?;
            let id = parse_id(&id)?;
            store.remove(id).with_context(|| format!("remove {id}"))?;
            println!("Removed {id}");
        }
        Commands::Shell => {
            let (engine, capture) = build_engine(&config)?;
            shell(&engine, &capture).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_store(config: &EngineConfig) -> Result<EnrollmentStore> {
    let dir = config.store_dir();
    let kv = FileKvStore::open(&dir)
        .with_context(|| format!("open store directory {}", dir.display()))?;
    let (store, report) = EnrollmentStore::open(Arc::new(kv)).context("load gallery")?;
    for skipped in &report.skipped {
        eprintln!(
            "warning: skipped stored identity #{}: {}",
            skipped.index, skipped.reason
        );
    }
    Ok(store)
}

fn build_engine(config: &EngineConfig) -> Result<(EngineHandle, StagedImageCapture)> {
    let store = open_store(config)?;
    let model_path = config.model_path();
    let extractor = ArcFaceExtractor::load(&model_path, config.min_face_size)
        .with_context(|| format!("load model {}", model_path.display()))?;

    let capture = StagedImageCapture::new();
    let controller = SessionController::new(
        Box::new(capture.clone()),
        Box::new(FullFrameDetector),
        Box::new(extractor),
        Arc::new(store),
        config,
    );
    Ok((EngineHandle::new(controller), capture))
}

async fn enroll(
    engine: &EngineHandle,
    capture: &StagedImageCapture,
    label: &str,
    image: &Path,
    multi_shot: bool,
) -> Result<IdentityId> {
    capture.stage(image);
    let id = if multi_shot {
        engine.enroll_multi_shot(label).await
    } else {
        engine.enroll(label).await
    };
    if id.is_err() {
        capture.clear();
    }
    id.with_context(|| format!("enroll {}", image.display()))
}

async fn verify(
    engine: &EngineHandle,
    capture: &StagedImageCapture,
    image: &Path,
) -> Result<VerificationOutcome> {
    capture.stage(image);
    let outcome = engine.verify().await;
    if outcome.is_err() {
        capture.clear();
    }
    outcome.with_context(|| format!("verify {}", image.display()))
}

fn parse_id(raw: &str) -> Result<IdentityId> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid identity id: {raw}"))
}

fn print_identities(identities: &[IdentitySummary]) {
    if identities.is_empty() {
        println!("No faces enrolled");
        return;
    }
    for identity in identities {
        println!(
            "{}  {:<24} {} shot(s)  enrolled {}",
            identity.id,
            identity.label,
            identity.embedding_count,
            identity.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_outcome(outcome: &VerificationOutcome) {
    match outcome {
        VerificationOutcome::Completed(result) => {
            match &result.matched {
                Some(candidate) if result.success => println!(
                    "Match: {} (confidence {:.1}%)",
                    candidate.label,
                    candidate.score * 100.0
                ),
                _ => println!(
                    "No match (best {:.1}%, threshold {:.1}%)",
                    result.score * 100.0,
                    result.threshold * 100.0
                ),
            }
            for (rank, candidate) in result.ranked.iter().enumerate() {
                println!("  {}. {:<24} {:.1}%", rank + 1, candidate.label, candidate.score * 100.0);
            }
        }
        VerificationOutcome::NoFaceDetected { .. } => println!("No face detected"),
        VerificationOutcome::Failed { error, .. } => println!("Verification failed: {error}"),
    }
}

fn print_history(history: &[VerificationOutcome]) {
    if history.is_empty() {
        println!("No verifications yet");
        return;
    }
    for outcome in history {
        let at = outcome.at().format("%H:%M:%S");
        match outcome {
            VerificationOutcome::Completed(result) => {
                let label = result
                    .matched
                    .as_ref()
                    .filter(|_| result.success)
                    .map_or("no match", |c| c.label.as_str());
                println!("{at}  {label:<24} {:.1}%", result.score * 100.0);
            }
            VerificationOutcome::NoFaceDetected { .. } => println!("{at}  no face detected"),
            VerificationOutcome::Failed { error, .. } => println!("{at}  failed: {error}"),
        }
    }
}

const SHELL_HELP: &str = "\
commands:
  enroll [--multi-shot] <image> <label>
  verify <image>
  list
  remove <id>
  history
  clear
  status
  quit";

async fn shell(engine: &EngineHandle, capture: &StagedImageCapture) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("{SHELL_HELP}");

    loop {
        stdout.write_all(b"facevault> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            continue;
        };

        match run_shell_command(engine, capture, command, args).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }
    Ok(())
}

/// Run one shell command; `Ok(false)` ends the session.
async fn run_shell_command(
    engine: &EngineHandle,
    capture: &StagedImageCapture,
    command: &str,
    args: &[&str],
) -> Result<bool> {
    match command {
        "enroll" => {
            let (multi_shot, args) = match args.split_first() {
                Some((&"--multi-shot", rest)) => (true, rest),
                _ => (false, args),
            };
            let Some((image, label)) = args.split_first() else {
                bail!("usage: enroll [--multi-shot] <image> <label>");
            };
            let label = label.join(" ");
            let id = enroll(engine, capture, &label, Path::new(image), multi_shot).await?;
            println!("Enrolled {label} ({id})");
        }
        "verify" => {
            let [image] = args else {
                bail!("usage: verify <image>");
            };
            let outcome = verify(engine, capture, Path::new(image)).await?;
            print_outcome(&outcome);
        }
        "list" => print_identities(&engine.list_identities()),
        "remove" => {
            let [id] = args else {
                bail!("usage: remove <id>");
            };
            let id = parse_id(id)?;
            engine.remove_identity(id).await?;
            println!("Removed {id}");
        }
        "history" => print_history(&engine.history()),
        "clear" => {
            engine.clear_history();
            println!("History cleared");
        }
        "status" => println!("state: {}", engine.state()),
        "quit" | "exit" => return Ok(false),
        "help" => println!("{SHELL_HELP}"),
        other => println!("unknown command: {other}\n{SHELL_HELP}"),
    }
    Ok(true)
}
