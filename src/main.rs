mod batch;
mod capture;
mod config;
mod error;
mod sampling;
mod vision;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use batch::{is_video, run_batch, BatchOptions, ConflictPolicy};
use capture::{extract_frames, FfmpegDecoder, VideoDecoder};
use config::{
    CaptionSettings, EndpointConfig, DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_TIMEOUT_SECS,
};
use error::CaptionError;
use sampling::{SamplingSpec, SamplingStrategy};
use vision::{Captioner, VisionClient};

#[derive(Parser)]
#[command(name = "clipcap")]
#[command(about = "Caption short video clips with a vision language model", long_about = None)]
struct Cli {
    /// Base URL of the OpenAI-compatible API
    #[arg(long, env = "LMSTUDIO_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
    /// Model used when a request does not name one
    #[arg(long, env = "LMSTUDIO_MODEL", default_value = DEFAULT_MODEL)]
    default_model: String,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
    /// Overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Caption one video and print the result as JSON
    Caption {
        input_file: PathBuf,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Caption every video in a folder, writing a .txt next to each
    Batch {
        folder: PathBuf,
        #[command(flatten)]
        request: RequestArgs,
        /// Replace existing caption files
        #[arg(long)]
        overwrite: bool,
        /// Put the new caption above the existing one (wins over --overwrite)
        #[arg(long)]
        prepend_existing: bool,
    },
}

#[derive(Args)]
struct RequestArgs {
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    system_prompt: String,
    #[arg(short, long, default_value = "")]
    model: String,
    /// Text the model's reply is forced to start with
    #[arg(short, long, default_value = "")]
    prefill: String,
    #[arg(short, long, default_value_t = 5)]
    num_frames: u32,
    #[arg(short, long, value_enum, default_value_t = SamplingStrategy::Uniform)]
    sampling: SamplingStrategy,
}

impl From<RequestArgs> for CaptionSettings {
    fn from(args: RequestArgs) -> Self {
        CaptionSettings {
            system_prompt: args.system_prompt,
            model: args.model,
            prefill: args.prefill,
            sampling: SamplingSpec::new(args.num_frames, args.sampling),
        }
    }
}

#[derive(Debug, Serialize)]
struct CaptionOutput {
    caption: String,
    frames_used: usize,
}

async fn caption_file<D, C>(
    path: &Path,
    settings: &CaptionSettings,
    decoder: &D,
    captioner: &C,
) -> Result<CaptionOutput, CaptionError>
where
    D: VideoDecoder,
    C: Captioner + ?Sized,
{
    if !is_video(path) {
        return Err(CaptionError::UnsupportedExtension(path.to_path_buf()));
    }
    let frames = extract_frames(decoder, path, settings.sampling)?;
    info!(path = %path.display(), frames = frames.len(), "frames extracted");
    let caption = captioner.caption(&frames, settings).await?;
    Ok(CaptionOutput {
        caption,
        frames_used: frames.len(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let endpoint = EndpointConfig {
        base_url: cli.base_url,
        default_model: cli.default_model,
        timeout: Duration::from_secs(cli.timeout_secs),
    };
    let decoder = FfmpegDecoder::new()?;
    let captioner = VisionClient::new(endpoint)?;

    match cli.command {
        Command::Caption {
            input_file,
            request,
        } => {
            let settings = CaptionSettings::from(request);
            let output = caption_file(&input_file, &settings, &decoder, &captioner).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Batch {
            folder,
            request,
            overwrite,
            prepend_existing,
        } => {
            let options = BatchOptions {
                settings: CaptionSettings::from(request),
                conflict: ConflictPolicy::from_flags(overwrite, prepend_existing),
            };
            let report = run_batch(&folder, &options, &decoder, &captioner).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
