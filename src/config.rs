//! Optional `key = value` config file supplying CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use docfetch_core::download::ProxyMode;
use docfetch_core::proxy::RotationStrategy;

/// Defaults read from the config file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    /// Requests per second.
    pub rate: Option<f64>,
    pub burst: Option<u32>,
    pub max_retries: Option<u32>,
    pub checkpoint: Option<PathBuf>,
    pub checkpoint_every: Option<u64>,
    pub proxy_file: Option<PathBuf>,
    pub proxy_strategy: Option<RotationStrategy>,
    pub proxy_mode: Option<ProxyMode>,
    pub drain_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates config values against the same ranges the CLI enforces.
    pub fn validate(&self) -> Result<()> {
        if let Some(workers) = self.workers
            && !(1..=100).contains(&workers)
        {
            bail!("Invalid config value for `workers`: {workers}. Expected range: 1..=100");
        }
        if let Some(rate) = self.rate
            && !(0.0..=10_000.0).contains(&rate)
        {
            bail!("Invalid config value for `rate`: {rate}. Expected range: 0..=10000");
        }
        if let Some(burst) = self.burst
            && !(1..=10_000).contains(&burst)
        {
            bail!("Invalid config value for `burst`: {burst}. Expected range: 1..=10000");
        }
        if let Some(retries) = self.max_retries
            && retries > 10
        {
            bail!("Invalid config value for `max_retries`: {retries}. Expected range: 0..=10");
        }
        if self.checkpoint_every == Some(0) {
            bail!("Invalid config value for `checkpoint_every`: 0. Expected at least 1");
        }
        validate_secs("drain_timeout_secs", self.drain_timeout_secs, 0)?;
        validate_secs("connect_timeout_secs", self.connect_timeout_secs, 1)?;
        validate_secs("read_timeout_secs", self.read_timeout_secs, 1)?;
        Ok(())
    }
}

fn validate_secs(field: &str, value: Option<u64>, min: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..=3600");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Filter directive used when neither `RUST_LOG` nor a flag decides.
    #[must_use]
    pub fn filter(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/docfetch/config.toml`
/// 2. `$HOME/.config/docfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("docfetch").join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("docfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), otherwise the default path if
/// present. Returns the path used alongside the config.
pub fn load(explicit: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>> {
    if let Some(path) = explicit {
        return load_file_config(path).map(|cfg| Some((path.to_path_buf(), cfg)));
    }
    let Some(path) = resolve_default_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let cfg = load_file_config(&path)?;
    Ok(Some((path, cfg)))
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(parse_string_literal(value).with_context(invalid)?.into());
            }
            "checkpoint" => {
                cfg.checkpoint = Some(parse_string_literal(value).with_context(invalid)?.into());
            }
            "proxy_file" => {
                cfg.proxy_file = Some(parse_string_literal(value).with_context(invalid)?.into());
            }
            "workers" => {
                let n = parse_integer_u64(value).with_context(invalid)?;
                cfg.workers = Some(usize::try_from(n).with_context(invalid)?);
            }
            "rate" => cfg.rate = Some(parse_float(value).with_context(invalid)?),
            "burst" => {
                let n = parse_integer_u64(value).with_context(invalid)?;
                cfg.burst = Some(u32::try_from(n).with_context(invalid)?);
            }
            "max_retries" => {
                let n = parse_integer_u64(value).with_context(invalid)?;
                cfg.max_retries = Some(u32::try_from(n).with_context(invalid)?);
            }
            "checkpoint_every" => {
                cfg.checkpoint_every = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "drain_timeout_secs" => {
                cfg.drain_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "proxy_strategy" => {
                let label = parse_string_literal(value).with_context(invalid)?;
                cfg.proxy_strategy = Some(
                    label
                        .parse::<RotationStrategy>()
                        .map_err(anyhow::Error::msg)
                        .with_context(invalid)?,
                );
            }
            "proxy_mode" => {
                let label = parse_string_literal(value).with_context(invalid)?;
                cfg.proxy_mode = Some(
                    label
                        .parse::<ProxyMode>()
                        .map_err(anyhow::Error::msg)
                        .with_context(invalid)?,
                );
            }
            "verbosity" => {
                let label = parse_string_literal(value).with_context(invalid)?;
                cfg.verbosity = Some(parse_verbosity(&label).with_context(|| {
                    format!("Invalid `verbosity` value '{label}' on line {line_no}")
                })?);
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_float(raw_value: &str) -> Result<f64> {
    let value: f64 = raw_value.trim().parse()?;
    if !value.is_finite() {
        bail!("Expected a finite number");
    }
    Ok(value)
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        other => bail!("Unknown verbosity '{other}'. Expected default, verbose, quiet or debug"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
# docfetch defaults
output_dir = "/data/docs"
workers = 20
rate = 2.5          # per second
burst = 5
max_retries = 4
checkpoint = "/data/job.json"
checkpoint_every = 25
proxy_file = "proxies.txt"
proxy_strategy = "best_performing"
proxy_mode = "prefer_proxy"
drain_timeout_secs = 60
verbosity = "verbose"
"#;
        let cfg = parse_config_str(raw).unwrap();
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/data/docs")));
        assert_eq!(cfg.workers, Some(20));
        assert_eq!(cfg.rate, Some(2.5));
        assert_eq!(cfg.burst, Some(5));
        assert_eq!(cfg.checkpoint_every, Some(25));
        assert_eq!(cfg.proxy_strategy, Some(RotationStrategy::BestPerforming));
        assert_eq!(cfg.proxy_mode, Some(ProxyMode::PreferProxy));
        assert_eq!(cfg.verbosity, Some(VerbositySetting::Verbose));
    }

    #[test]
    fn test_hash_inside_string_is_not_a_comment() {
        let cfg = parse_config_str(r#"output_dir = "/tmp/#docs""#).unwrap();
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/tmp/#docs")));
    }

    #[test]
    fn test_rejects_unknown_key_and_bad_syntax() {
        let err = parse_config_str("colour = \"red\"").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(parse_config_str("workers 10").is_err());
        assert!(parse_config_str("output_dir = /unquoted").is_err());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(parse_config_str("workers = 0").is_err());
        assert!(parse_config_str("workers = 101").is_err());
        assert!(parse_config_str("max_retries = 11").is_err());
        assert!(parse_config_str("checkpoint_every = 0").is_err());
        assert!(parse_config_str("rate = -1").is_err());
        assert!(parse_config_str("read_timeout_secs = 0").is_err());
        assert!(parse_config_str("proxy_strategy = \"random\"").is_err());
    }

    #[test]
    fn test_load_explicit_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = 3\n").unwrap();
        let (used, cfg) = load(Some(&path)).unwrap().unwrap();
        assert_eq!(used, path);
        assert_eq!(cfg.workers, Some(3));
    }
}
