//! Command-line argument parsing.

use std::path::PathBuf;

use kebab_core::{AppConfig, DownloadType, MAX_WORKER_COUNT, MIN_WORKER_COUNT};

/// Usage text printed for `--help`.
pub const USAGE: &str = "\
Usage: kebab [OPTIONS] [URL]...

Download every URL into the configured download root.

Options:
  -r, --root <DIR>       Download root directory
  -w, --workers <N>      Number of concurrent downloads (1-8)
  -t, --type <TYPE>      audio, video, playlist-audio or playlist-video
  -v, --verbose          Verbose logging
  -c, --config <FILE>    Configuration file to use instead of the default
      --save-config      Persist the options above as the new defaults
      --reset-config     Restore the default configuration first
  -h, --help             Print this help
";

/// Errors produced while parsing arguments.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgsError {
    /// A flag that takes a value was last on the line.
    #[error("Missing value for {flag}")]
    MissingValue {
        /// The flag.
        flag: String,
    },

    /// A flag that is not recognised.
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    /// A flag value that could not be parsed.
    #[error("Invalid value '{value}' for {flag}: {reason}")]
    InvalidValue {
        /// The flag.
        flag: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Parsed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    /// Override for the download root.
    pub root: Option<PathBuf>,
    /// Override for the worker count.
    pub workers: Option<usize>,
    /// Override for the download type.
    pub download_type: Option<DownloadType>,
    /// Verbose logging.
    pub verbose: bool,
    /// Configuration file override.
    pub config: Option<PathBuf>,
    /// Save the resulting configuration.
    pub save_config: bool,
    /// Reset the stored configuration to defaults before applying overrides.
    pub reset_config: bool,
    /// Print usage and exit.
    pub help: bool,
    /// URLs to download, in order.
    pub urls: Vec<String>,
}

impl Args {
    /// Parse arguments, excluding the program name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown flags, missing values, or values that
    /// do not parse.
    pub fn parse<I, S>(args: I) -> Result<Self, ArgsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter().map(Into::into);
        let mut positional_only = false;

        while let Some(arg) = args.next() {
            if positional_only || !arg.starts_with('-') || arg == "-" {
                parsed.urls.push(arg);
                continue;
            }

            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };

            match flag.as_str() {
                "--" => positional_only = true,
                "-h" | "--help" => parsed.help = true,
                "-v" | "--verbose" => parsed.verbose = true,
                "--save-config" => parsed.save_config = true,
                "--reset-config" => parsed.reset_config = true,
                "-c" | "--config" => {
                    let value = take_value(&flag, inline, &mut args)?;
                    parsed.config = Some(absolute(&PathBuf::from(value)));
                }
                "-r" | "--root" => {
                    let value = take_value(&flag, inline, &mut args)?;
                    parsed.root = Some(PathBuf::from(value));
                }
                "-w" | "--workers" => {
                    let value = take_value(&flag, inline, &mut args)?;
                    parsed.workers = Some(parse_workers(&flag, &value)?);
                }
                "-t" | "--type" => {
                    let value = take_value(&flag, inline, &mut args)?;
                    let download_type =
                        value
                            .parse::<DownloadType>()
                            .map_err(|reason| ArgsError::InvalidValue {
                                flag: flag.clone(),
                                value: value.clone(),
                                reason,
                            })?;
                    parsed.download_type = Some(download_type);
                }
                _ => return Err(ArgsError::UnknownOption(arg)),
            }
        }

        Ok(parsed)
    }

    /// Apply the overrides to `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the download root is not usable.
    pub fn apply(&self, config: &mut AppConfig) -> kebab_core::Result<()> {
        if let Some(root) = &self.root {
            config.set_download_root(absolute(root))?;
        }
        if let Some(workers) = self.workers {
            config.pool.worker_count = workers;
        }
        if let Some(download_type) = self.download_type {
            config.default_download_type = download_type;
        }
        Ok(())
    }
}

fn take_value(
    flag: &str,
    inline: Option<String>,
    args: &mut impl Iterator<Item = String>,
) -> Result<String, ArgsError> {
    inline.or_else(|| args.next()).ok_or_else(|| ArgsError::MissingValue {
        flag: flag.to_string(),
    })
}

fn parse_workers(flag: &str, value: &str) -> Result<usize, ArgsError> {
    let invalid = |reason: String| ArgsError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason,
    };

    let workers = value.parse::<usize>().map_err(|e| invalid(e.to_string()))?;
    if (MIN_WORKER_COUNT..=MAX_WORKER_COUNT).contains(&workers) {
        Ok(workers)
    } else {
        Err(invalid(format!(
            "must be between {MIN_WORKER_COUNT} and {MAX_WORKER_COUNT}"
        )))
    }
}

/// Resolve a relative root against the working directory.
fn absolute(path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_urls_in_order() {
        let args = Args::parse(["https://a.test/1", "https://a.test/2"]).unwrap();
        assert_eq!(args.urls, vec!["https://a.test/1", "https://a.test/2"]);
        assert!(!args.verbose);
        assert!(args.root.is_none());
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse([
            "--root",
            "/tmp/media",
            "-w",
            "4",
            "--type=playlist-video",
            "-v",
            "--save-config",
            "https://a.test/x",
        ])
        .unwrap();

        assert_eq!(args.root, Some(PathBuf::from("/tmp/media")));
        assert_eq!(args.workers, Some(4));
        assert_eq!(args.download_type, Some(DownloadType::PlaylistVideo));
        assert!(args.verbose);
        assert!(args.save_config);
        assert_eq!(args.urls, vec!["https://a.test/x"]);
    }

    #[test]
    fn test_parse_config_flags() {
        let args = Args::parse(["--config=/etc/kebab.json", "--reset-config"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/kebab.json")));
        assert!(args.reset_config);
        assert!(!args.save_config);
    }

    #[test]
    fn test_double_dash_ends_options() {
        let args = Args::parse(["--", "--verbose"]).unwrap();
        assert!(!args.verbose);
        assert_eq!(args.urls, vec!["--verbose"]);
    }

    #[test]
    fn test_missing_value() {
        assert_eq!(
            Args::parse(["--workers"]),
            Err(ArgsError::MissingValue {
                flag: "--workers".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_option() {
        assert_eq!(
            Args::parse(["--fast"]),
            Err(ArgsError::UnknownOption("--fast".to_string()))
        );
    }

    #[test]
    fn test_workers_out_of_range() {
        let err = Args::parse(["--workers", "9"]).unwrap_err();
        assert!(matches!(err, ArgsError::InvalidValue { .. }));
        assert!(Args::parse(["--workers", "0"]).is_err());
        assert!(Args::parse(["--workers", "many"]).is_err());
    }

    #[test]
    fn test_invalid_type() {
        let err = Args::parse(["-t", "podcast"]).unwrap_err();
        assert!(err.to_string().contains("podcast"));
    }

    #[test]
    fn test_apply_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("media");
        let args = Args {
            root: Some(root.clone()),
            workers: Some(5),
            download_type: Some(DownloadType::Video),
            ..Args::default()
        };

        let mut config = AppConfig::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.download_root, root);
        assert_eq!(config.pool.worker_count, 5);
        assert_eq!(config.default_download_type, DownloadType::Video);
        assert!(root.is_dir());
    }

    #[test]
    fn test_apply_without_overrides_keeps_config() {
        let mut config = AppConfig::default();
        let before = config.clone();
        Args::default().apply(&mut config).unwrap();
        assert_eq!(config, before);
    }
}
