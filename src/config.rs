//! YAML configuration: the fetcher catalogue, visualization methods and the
//! discovery settings.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fetch_model::{
    ArgTemplate, IMAGE_PLACEHOLDER, ProgramDescriptor, VisualizationMethod, nullable_args,
};
use serde::Deserialize;
use serde::de::{Deserializer, MapAccess, Visitor};
use tracing::{info, warn};

use crate::error::Error;
use crate::fetcher_set::DiscoveryOptions;
use crate::paths::Paths;

/// Catalogue written on first run and on `--reset`.
pub const DEFAULT_TEMPLATE: &str = include_str!("../config/fetchers.yaml");

const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT_BUDGET_FACTOR: u32 = 3;
/// Upper bound on the latency budget, in seconds.
const MAX_LATENCY_BUDGET_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    pub fetchers: Vec<ProgramDescriptor>,
    #[serde(default, deserialize_with = "deserialize_methods")]
    pub image_methods: Vec<VisualizationMethod>,
    /// Maximum probe time in seconds for a fetcher to be kept.
    #[serde(default = "default_latency_budget")]
    pub latency_budget: f64,
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,
    /// Hard limit for a single probe. Derived from the budget when unset.
    #[serde(default, with = "humantime_serde")]
    pub probe_timeout: Option<Duration>,
    /// Lowercase extensions, without dot, recognised as images.
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

#[derive(Deserialize)]
struct MethodEntry {
    caller: String,
    #[serde(default, deserialize_with = "nullable_args")]
    args: ArgTemplate,
}

/// `image_methods` is a mapping keyed by method name; keep document order.
struct MethodTable(Vec<VisualizationMethod>);

impl<'de> Deserialize<'de> for MethodTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MethodTableVisitor;

        impl<'de> Visitor<'de> for MethodTableVisitor {
            type Value = MethodTable;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of method name to {caller, args}")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut methods = Vec::new();
                while let Some((name, entry)) = map.next_entry::<String, MethodEntry>()? {
                    methods.push(VisualizationMethod {
                        name,
                        caller: entry.caller,
                        args: entry.args,
                    });
                }
                Ok(MethodTable(methods))
            }
        }

        deserializer.deserialize_map(MethodTableVisitor)
    }
}

fn deserialize_methods<'de, D>(deserializer: D) -> Result<Vec<VisualizationMethod>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<MethodTable>::deserialize(deserializer)?
        .map(|table| table.0)
        .unwrap_or_default())
}

impl Configuration {
    /// Parse and validate a configuration document. `origin` is only used in
    /// error messages.
    pub fn from_yaml_str(input: &str, origin: &Path) -> Result<Self, Error> {
        let cfg: Configuration =
            serde_yaml::from_str(input).map_err(|err| Error::configuration(origin, err))?;
        cfg.validated(origin)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, Error> {
        let data = fs::read_to_string(path)
            .map_err(|err| Error::configuration(path, format!("failed to read: {err}")))?;
        Self::from_yaml_str(&data, path)
    }

    /// Load `fetchers.yaml`, writing the default catalogue first when it is
    /// missing or when `reset` asks for a fresh copy.
    pub fn load_or_init(paths: &Paths, reset: bool) -> Result<Self, Error> {
        let path = paths.config_file();
        if reset || !path.exists() {
            restore_default(&path)?;
        }
        Self::from_yaml_file(&path)
    }

    pub fn validated(self, origin: &Path) -> Result<Self, Error> {
        let fail = |reason: String| Error::configuration(origin, reason);

        if self.fetchers.is_empty() {
            return Err(fail("at least one fetcher must be configured".into()));
        }
        let mut names = HashSet::new();
        for (idx, fetcher) in self.fetchers.iter().enumerate() {
            if fetcher.name.trim().is_empty() {
                return Err(fail(format!("fetchers[{idx}].name must not be blank")));
            }
            if fetcher.path.trim().is_empty() {
                return Err(fail(format!("fetchers[{idx}].path must not be blank")));
            }
            if let Some(req) = &fetcher.extra_requirement
                && req.name().trim().is_empty()
            {
                return Err(fail(format!(
                    "fetchers[{idx}].extra_requirement must name something"
                )));
            }
            if !names.insert(fetcher.name.as_str()) {
                return Err(fail(format!("duplicate fetcher name `{}`", fetcher.name)));
            }
        }
        for method in &self.image_methods {
            if method.caller.trim().is_empty() {
                return Err(fail(format!(
                    "image_methods.{}.caller must not be blank",
                    method.name
                )));
            }
            if !names.contains(method.caller.as_str()) {
                warn!(method = %method.name, caller = %method.caller, "image method caller matches no fetcher; ignoring");
            } else if !method.args.flatten().contains(IMAGE_PLACEHOLDER) {
                warn!(method = %method.name, "image method args have no `{{}}` placeholder");
            }
        }
        if !budget_in_range(self.latency_budget) {
            return Err(fail(format!(
                "latency_budget must be between 0 and {MAX_LATENCY_BUDGET_SECS} seconds (got {})",
                self.latency_budget
            )));
        }
        if self.probe_workers == 0 {
            return Err(fail("probe_workers must be at least 1".into()));
        }
        if self.image_extensions.iter().any(|ext| ext.trim().is_empty()) {
            return Err(fail("image_extensions must not contain blank entries".into()));
        }
        Ok(self)
    }

    /// Replace the budget, e.g. from `--timeout`.
    pub fn with_latency_budget(mut self, seconds: f64) -> Result<Self, Error> {
        if !budget_in_range(seconds) {
            return Err(Error::configuration(
                "--timeout",
                format!(
                    "latency budget must be between 0 and {MAX_LATENCY_BUDGET_SECS} seconds (got {seconds})"
                ),
            ));
        }
        self.latency_budget = seconds;
        Ok(self)
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::try_from_secs_f64(self.latency_budget).unwrap_or(Duration::MAX)
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout.unwrap_or_else(|| {
            self.latency_budget()
                .checked_mul(PROBE_TIMEOUT_BUDGET_FACTOR)
                .unwrap_or(Duration::MAX)
                .max(MIN_PROBE_TIMEOUT)
        })
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            latency_budget: self.latency_budget(),
            workers: self.probe_workers,
        }
    }

    pub fn image_extensions(&self) -> Vec<String> {
        self.image_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .collect()
    }
}

fn budget_in_range(seconds: f64) -> bool {
    seconds.is_finite() && (0.0..=MAX_LATENCY_BUDGET_SECS).contains(&seconds)
}

/// Overwrite `path` with the bundled default catalogue.
pub fn restore_default(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_TEMPLATE)?;
    info!(path = %path.display(), "wrote default fetcher configuration");
    Ok(())
}

fn default_latency_budget() -> f64 {
    2.0
}

fn default_probe_workers() -> usize {
    4
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Path used in error messages for configuration that did not come from disk.
pub fn inline_origin() -> PathBuf {
    PathBuf::from("<inline>")
}
