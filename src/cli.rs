//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use bulkget_core::EngineConfig;
use clap::Parser;

/// Resumable, throttled batch downloads.
///
/// URLs come from the arguments, or from stdin (one per line) when none are
/// given. Every option also has an environment variable; flags win.
#[derive(Parser, Debug)]
#[command(name = "bulkget")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download
    pub urls: Vec<String>,

    /// Output folder [env: OUTPUT_FOLDER, default: downloaded_files]
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100) [env: MAX_CONCURRENT, default: 5]
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Retries after the first attempt (1-10) [env: RETRY_ATTEMPTS, default: 3]
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub retries: Option<u8>,

    /// Segment workers per file (1-16) [env: WORKERS_PER_JOB, default: 4]
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub workers: Option<u8>,

    /// Bandwidth cap in MiB/s, 0 for unlimited [env: MAX_BANDWIDTH]
    #[arg(short = 'b', long, value_parser = parse_bandwidth)]
    pub bandwidth: Option<f64>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_bandwidth(raw: &str) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err("must be a finite number >= 0".to_string())
    }
}

impl Args {
    /// Applies the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(output) = &self.output {
            config.output_folder.clone_from(output);
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent = usize::from(concurrency);
        }
        if let Some(retries) = self.retries {
            config.retry_attempts = u32::from(retries);
        }
        if let Some(workers) = self.workers {
            config.workers_per_job = usize::from(workers);
        }
        if let Some(bandwidth) = self.bandwidth {
            config.max_bandwidth_mbps = bandwidth;
        }
    }

    /// `tracing` filter used when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["bulkget"]).unwrap();
        assert!(args.urls.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.concurrency, None);
        assert_eq!(args.default_log_level(), "info");
    }

    #[test]
    fn test_cli_positional_urls() {
        let args =
            Args::try_parse_from(["bulkget", "https://a.example/x", "https://b.example/y"]).unwrap();
        assert_eq!(args.urls.len(), 2);
    }

    #[test]
    fn test_cli_verbosity_levels() {
        let args = Args::try_parse_from(["bulkget", "-v"]).unwrap();
        assert_eq!(args.default_log_level(), "debug");
        let args = Args::try_parse_from(["bulkget", "-vv"]).unwrap();
        assert_eq!(args.default_log_level(), "trace");
        let args = Args::try_parse_from(["bulkget", "-q", "-vv"]).unwrap();
        assert_eq!(args.default_log_level(), "error");
    }

    #[test]
    fn test_cli_concurrency_bounds() {
        assert_eq!(
            Args::try_parse_from(["bulkget", "-c", "100"]).unwrap().concurrency,
            Some(100)
        );
        for bad in ["0", "101"] {
            let err = Args::try_parse_from(["bulkget", "-c", bad]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn test_cli_workers_bounds() {
        assert_eq!(
            Args::try_parse_from(["bulkget", "-w", "16"]).unwrap().workers,
            Some(16)
        );
        let err = Args::try_parse_from(["bulkget", "-w", "17"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_negative_bandwidth_rejected() {
        let err = Args::try_parse_from(["bulkget", "-b", "-1"]).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::ValueValidation | ErrorKind::UnknownArgument
        ));
        let args = Args::try_parse_from(["bulkget", "-b", "2.5"]).unwrap();
        assert_eq!(args.bandwidth, Some(2.5));
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["bulkget", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_apply_overrides_only_given_flags() {
        let args = Args::try_parse_from(["bulkget", "-o", "/tmp/out", "-c", "2", "-w", "8"]).unwrap();
        let mut config = EngineConfig {
            retry_attempts: 7,
            ..EngineConfig::default()
        };
        args.apply(&mut config);
        assert_eq!(config.output_folder, PathBuf::from("/tmp/out"));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.workers_per_job, 8);
        assert_eq!(config.retry_attempts, 7);
    }
}
