//! Command-line argument parsing

use crate::config::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, FilterCriteria, PushConfig, PushOptions};
use crate::error::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "registry-pusher")]
#[command(about = "Discover local OCI images and push them to a container registry")]
#[command(version, author)]
pub struct Args {
    /// Target registry
    #[arg(
        long = "registry",
        short = 'r',
        help = "Registry host to push to, e.g. localhost:5000 (scheme optional)"
    )]
    pub registry: String,

    /// Registry username
    #[arg(
        long = "username",
        short = 'u',
        help = "Username for registry authentication"
    )]
    pub username: Option<String>,

    /// Registry password
    #[arg(
        long = "password",
        short = 'p',
        help = "Password for registry authentication"
    )]
    pub password: Option<String>,

    /// Skip TLS verification
    #[arg(
        long = "insecure",
        short = 'k',
        default_value = "false",
        help = "Skip TLS certificate verification"
    )]
    pub insecure: bool,

    /// Directory searched for images
    #[arg(
        long = "build-path",
        short = 'b',
        default_value = ".",
        help = "Directory searched for image tarballs and OCI layouts"
    )]
    pub build_path: PathBuf,

    #[arg(
        long = "max-retries",
        default_value_t = DEFAULT_MAX_RETRIES,
        help = "Attempts per image before giving up"
    )]
    pub max_retries: u32,

    /// Number of concurrent pushes
    #[arg(
        long = "concurrency",
        short = 'j',
        default_value_t = DEFAULT_CONCURRENCY,
        help = "Maximum number of images pushed at the same time"
    )]
    pub concurrency: usize,

    /// Chunk size for blob upload (default: 1MB)
    #[arg(
        long = "chunk-size",
        short = 'c',
        default_value = "1048576",
        help = "Blob bytes sent per upload request"
    )]
    pub chunk_size: usize,

    /// Timeout in seconds for network operations
    #[arg(
        long = "timeout",
        short = 't',
        default_value = "300",
        help = "Per-request timeout in seconds"
    )]
    pub timeout: u64,

    #[arg(
        long = "token-auth",
        default_value = "false",
        help = "Exchange credentials for a bearer token with the registry's token service"
    )]
    pub token_auth: bool,

    #[arg(
        long = "include",
        help = "Only push images whose name matches this glob (repeatable)"
    )]
    pub include: Vec<String>,

    #[arg(
        long = "exclude",
        help = "Skip images whose name matches this glob (repeatable)"
    )]
    pub exclude: Vec<String>,

    /// Verbose output
    #[arg(
        long = "verbose",
        short = 'v',
        env = "REGISTRY_PUSHER_VERBOSE",
        help = "Enable verbose output"
    )]
    pub verbose: bool,
}

impl Args {
    pub fn to_config(&self) -> Result<PushConfig> {
        PushConfig::new(PushOptions {
            username: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            build_path: self.build_path.clone(),
            max_retries: self.max_retries,
            concurrency: self.concurrency,
            chunk_size: self.chunk_size,
            timeout: Duration::from_secs(self.timeout),
            token_auth: self.token_auth,
            filter: Some(FilterCriteria {
                include: self.include.clone(),
                exclude: self.exclude.clone(),
                ..Default::default()
            }),
            ..PushOptions::new(&self.registry)
        })
    }
}
