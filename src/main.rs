use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use artifact_uploader::{
    FlagInterrupter, HttpUrlBrokerClient, NoopProgress, UploadConfig, UploadCoordinator,
};

#[derive(Parser)]
#[command(name = "artifact-uploader", about = "Publishes local files to an S3-compatible store via broker-issued presigned URLs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload one or more files to the configured broker/S3 endpoint.
    Upload {
        /// Base URL of the URL broker (e.g. https://broker.internal).
        #[arg(long)]
        broker_url: String,

        /// Prefixed to every logical artifact path to form the object key.
        #[arg(long, default_value = "")]
        path_prefix: String,

        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        #[arg(long, default_value_t = 1000)]
        base_delay_ms: u64,

        #[arg(long)]
        min_part_size: Option<u64>,

        #[arg(long)]
        multipart_threshold: Option<u64>,

        #[arg(long, default_value_t = false)]
        disable_multipart: bool,

        #[arg(long)]
        n_threads: Option<usize>,

        #[arg(long, default_value_t = false)]
        disable_consistency_check: bool,

        /// `FILE=ARTIFACT_PATH` pairs, e.g. `target/out.bin=bin/out.bin`.
        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let Command::Upload {
        broker_url,
        path_prefix,
        max_attempts,
        base_delay_ms,
        min_part_size,
        multipart_threshold,
        disable_multipart,
        n_threads,
        disable_consistency_check,
        files,
    } = cli.command;

    let parsed_files = match parse_file_args(&files) {
        Ok(f) => f,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config_builder = UploadConfig::builder()
        .path_prefix(path_prefix)
        .max_attempts(max_attempts)
        .base_delay_ms(base_delay_ms)
        .multipart_enabled(!disable_multipart)
        .consistency_check_enabled(!disable_consistency_check);
    if let Some(v) = min_part_size {
        config_builder = config_builder.min_part_size(v);
    }
    if let Some(v) = multipart_threshold {
        config_builder = config_builder.multipart_threshold(v);
    }
    if let Some(v) = n_threads {
        config_builder = config_builder.n_threads(v);
    }
    let config = config_builder.build();

    let http_client = match artifact_uploader::s3_client::build_client(&config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let http = Arc::new(artifact_uploader::S3HttpClient::new(
        http_client.clone(),
        &config.user_agent,
        config.consistency_check_enabled,
    ));
    let broker = Arc::new(HttpUrlBrokerClient::new(
        http_client,
        broker_url,
        config.artifact_keys_header_limit,
    ));

    let interrupter = Arc::new(FlagInterrupter::new());
    {
        let interrupter = interrupter.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupter.fire("received SIGINT");
            }
        });
    }

    let coordinator = UploadCoordinator::new(config, broker, http, Arc::new(NoopProgress), interrupter);
    match coordinator.run(parsed_files).await {
        Ok(uploaded) => {
            info!(count = uploaded.len(), "upload batch complete");
            for info in &uploaded {
                println!("{}\t{}\t{}", info.artifact_path, info.size, info.digest);
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("{failure}");
            ExitCode::FAILURE
        }
    }
}

fn parse_file_args(args: &[String]) -> Result<Vec<(PathBuf, String)>, String> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((file, artifact_path)) if !file.is_empty() && !artifact_path.is_empty() => {
                Ok((PathBuf::from(file), artifact_path.to_string()))
            }
            _ => Err(format!("expected FILE=ARTIFACT_PATH, got {arg:?}")),
        })
        .collect()
}
