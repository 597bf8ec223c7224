//! CLI entry point for mediaq
//!
//! `mediaq run` starts the daemon; every other subcommand talks to a running
//! daemon over its HTTP API.

mod client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::ApiClient;
use mediaq::hardware::{HardwareProbe, SystemDetector};
use mediaq::{Config, Daemon, Job, JobOptions, JobSpec, JobStatus, Resolution};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// mediaq - persistent media processing queue with engine fallback
#[derive(Parser, Debug)]
#[command(name = "mediaq")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, env = "MEDIAQ_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Daemon API address used by client commands
    #[arg(long, env = "MEDIAQ_URL", default_value = "http://127.0.0.1:7878")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Submit a job
    Submit {
        source: PathBuf,
        destination: PathBuf,
        #[arg(short, long, default_value = "default")]
        preset: String,
        /// Engine to try first
        #[arg(short, long)]
        engine: Option<String>,
        /// Encoder override, e.g. libsvtav1
        #[arg(long)]
        encoder: Option<String>,
        /// Output size as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_resolution)]
        resolution: Option<Resolution>,
        /// AI upscale factor (2-4)
        #[arg(long)]
        upscale: Option<u32>,
        #[arg(long)]
        face_restore: bool,
        #[arg(long)]
        audio_upsample: bool,
        #[arg(long)]
        strip_audio: bool,
    },
    /// List jobs
    List {
        /// Only jobs in this status
        #[arg(short, long)]
        status: Option<JobStatus>,
    },
    /// Show one job
    Status { id: String },
    /// Cancel a job
    Cancel { id: String },
    /// Stop dispatching new jobs and park running ones at their next stage
    Pause,
    /// Resume dispatch
    Resume,
    /// Remove finished jobs
    Clear,
    /// Queue counters
    Stats,
    /// Probe this host's hardware and print it as JSON
    Hardware,
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let width = w.trim().parse().map_err(|_| format!("bad width '{}'", w))?;
    let height = h.trim().parse().map_err(|_| format!("bad height '{}'", h))?;
    Ok(Resolution { width, height })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_job_line(job: &Job) {
    let stage = job.current_stage.as_deref().unwrap_or("-");
    println!(
        "{}  {:<10} {:>5.1}%  {:<10} {}",
        job.id,
        job.status.as_str(),
        job.progress,
        stage,
        job.spec.source.display()
    );
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("failed to load {}", path.display()))
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

async fn execute(args: Args) -> Result<()> {
    let api = ApiClient::new(&args.url);
    match args.command {
        Command::Run => {
            let config = load_config(&args.config)?;
            let daemon = Daemon::with_config(config).await?;
            daemon.run().await?;
        }
        Command::Submit {
            source,
            destination,
            preset,
            engine,
            encoder,
            resolution,
            upscale,
            face_restore,
            audio_upsample,
            strip_audio,
        } => {
            let mut spec = JobSpec::new(source, destination, preset).with_options(JobOptions {
                resolution,
                encoder,
                upscale,
                face_restore,
                audio_upsample,
                strip_audio,
            });
            if let Some(engine) = engine {
                spec = spec.with_engine_preference(engine);
            }
            let id = api.submit(&spec).await?;
            println!("{}", id);
        }
        Command::List { status } => {
            for job in api.list(status).await? {
                print_job_line(&job);
            }
        }
        Command::Status { id } => print_json(&api.status(&id).await?)?,
        Command::Cancel { id } => {
            let response = api.cancel(&id).await?;
            println!("{} {}", response.id, response.status);
        }
        Command::Pause => {
            api.set_paused(true).await?;
            println!("paused");
        }
        Command::Resume => {
            api.set_paused(false).await?;
            println!("resumed");
        }
        Command::Clear => {
            let response = api.clear_completed().await?;
            println!("removed {} jobs", response.removed);
        }
        Command::Stats => print_json(&api.stats().await?)?,
        Command::Hardware => {
            let config = load_config(&args.config)?;
            let probe = HardwareProbe::new(
                SystemDetector::new(config.engines.ffmpeg_path.clone(), config.hardware.disallow_hardware),
                Duration::from_secs(config.hardware.cache_ttl_secs),
            );
            let info = probe
                .detect(Duration::from_millis(config.hardware.probe_timeout_ms))
                .await;
            print_json(&info)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match execute(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(
            parse_resolution("1920x1080"),
            Ok(Resolution {
                width: 1920,
                height: 1080
            })
        );
        assert!(parse_resolution("1920").is_err());
        assert!(parse_resolution("wide x 1080").is_err());
    }

    #[test]
    fn test_submit_args() {
        let args = Args::try_parse_from([
            "mediaq", "submit", "a.mp4", "b.mp4", "--engine", "accelerated", "--upscale", "2",
        ])
        .unwrap();
        match args.command {
            Command::Submit {
                engine, upscale, preset, ..
            } => {
                assert_eq!(engine.as_deref(), Some("accelerated"));
                assert_eq!(upscale, Some(2));
                assert_eq!(preset, "default");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_list_status_filter() {
        let args = Args::try_parse_from(["mediaq", "list", "--status", "failed"]).unwrap();
        assert!(matches!(
            args.command,
            Command::List {
                status: Some(JobStatus::Failed)
            }
        ));
    }
}
