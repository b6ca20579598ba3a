use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    errors::Error,
    pacing::{FixedDelay, Pacer, TokenBucket},
    Result,
};

/// How items are spaced out; `item_delay` is the per-item period for both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep `item_delay` after every item.
    Fixed,
    /// Allow bursts of `burst` items, then one item per `item_delay`.
    TokenBucket { burst: u32 },
}

/// Typed, env-driven configuration for batch runs.
#[derive(Clone, Debug)]
pub struct Config {
    // Limits
    pub max_extract_bytes: u64,
    pub max_files: usize,
    pub max_run_time: Duration,

    // Pipeline behavior
    pub item_delay: Duration,
    pub pacing: Pacing,
    pub progress_every: usize,

    // Discovery
    pub primary_ext: String,
    pub sidecar_ext: String,

    // Scratch space
    pub temp_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_extract_bytes: 4 * 1024 * 1024,
            max_files: 2000,
            max_run_time: Duration::from_secs(120),
            item_delay: Duration::from_millis(500),
            pacing: Pacing::Fixed,
            progress_every: 5,
            primary_ext: "session".to_string(),
            sidecar_ext: "json".to_string(),
            temp_dir: env::temp_dir().join("zipbatch"),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (env in production, maps in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_extract_mb = parse_num::<u64>(&lookup, "ZIPBATCH_MAX_EXTRACT_MB")?;
        let max_extract_bytes = max_extract_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
            .unwrap_or(defaults.max_extract_bytes);
        if max_extract_bytes == 0 {
            return Err(Error::Config(
                "ZIPBATCH_MAX_EXTRACT_MB must be greater than zero".to_string(),
            ));
        }

        let max_files =
            parse_num::<usize>(&lookup, "ZIPBATCH_MAX_FILES")?.unwrap_or(defaults.max_files);

        // Durations are sometimes written with a seconds suffix ("120S").
        let max_run_time = match lookup("ZIPBATCH_MAX_RUN_SECS") {
            Some(raw) => {
                let trimmed = raw.trim().trim_end_matches(['S', 's']);
                let secs = trimmed.parse::<u64>().map_err(|_| {
                    Error::Config(format!("ZIPBATCH_MAX_RUN_SECS is not a number: {raw}"))
                })?;
                Duration::from_secs(secs)
            }
            None => defaults.max_run_time,
        };
        if max_run_time.is_zero() {
            return Err(Error::Config(
                "ZIPBATCH_MAX_RUN_SECS must be greater than zero".to_string(),
            ));
        }

        let item_delay = parse_num::<u64>(&lookup, "ZIPBATCH_ITEM_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.item_delay);

        let pacing = match lookup("ZIPBATCH_PACING").and_then(non_empty) {
            None => defaults.pacing,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "fixed" => Pacing::Fixed,
                "token" => {
                    let burst = parse_num::<u32>(&lookup, "ZIPBATCH_PACING_BURST")?.unwrap_or(5);
                    if burst == 0 {
                        return Err(Error::Config(
                            "ZIPBATCH_PACING_BURST must be greater than zero".to_string(),
                        ));
                    }
                    Pacing::TokenBucket { burst }
                }
                other => {
                    return Err(Error::Config(format!(
                        "ZIPBATCH_PACING must be fixed or token, got {other}"
                    )))
                }
            },
        };

        let progress_every = parse_num::<usize>(&lookup, "ZIPBATCH_PROGRESS_EVERY")?
            .unwrap_or(defaults.progress_every);
        if progress_every == 0 {
            return Err(Error::Config(
                "ZIPBATCH_PROGRESS_EVERY must be greater than zero".to_string(),
            ));
        }

        let primary_ext = ext_or(&lookup, "ZIPBATCH_PRIMARY_EXT", defaults.primary_ext)?;
        let sidecar_ext = ext_or(&lookup, "ZIPBATCH_SIDECAR_EXT", defaults.sidecar_ext)?;
        if primary_ext == sidecar_ext {
            return Err(Error::Config(format!(
                "primary and sidecar extensions must differ (both {primary_ext})"
            )));
        }

        let temp_dir = lookup("ZIPBATCH_TEMP_DIR")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or(defaults.temp_dir);

        Ok(Self {
            max_extract_bytes,
            max_files,
            max_run_time,
            item_delay,
            pacing,
            progress_every,
            primary_ext,
            sidecar_ext,
            temp_dir,
        })
    }

    /// Pacer for batch runs built from `pacing` and `item_delay`.
    pub fn pacer(&self) -> Arc<dyn Pacer> {
        match self.pacing {
            Pacing::Fixed => Arc::new(FixedDelay(self.item_delay)),
            Pacing::TokenBucket { burst } => Arc::new(TokenBucket::new(burst, self.item_delay)),
        }
    }

    /// Ensure the scratch root exists before any workspace is created under it.
    pub fn ensure_temp_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} is not a valid number: {raw}")))
}

fn ext_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> Result<String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let ext = raw.trim().trim_start_matches('.').to_lowercase();
    if ext.is_empty() {
        return Err(Error::Config(format!("{key} must not be empty")));
    }
    Ok(ext)
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
