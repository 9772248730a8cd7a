//! Runtime requirements a worker must satisfy

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Declarative description of the environment a worker must provide.
///
/// Two requirements are compatible when a worker provisioned for one can run
/// work declared under the other, see [`ForkRequirements::is_compatible_with`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForkRequirements {
    classpath: Vec<PathBuf>,
    launch_args: Vec<String>,
    env: BTreeMap<String, String>,
    max_memory_mb: Option<u64>,
    idle_working_dir: PathBuf,
}

impl ForkRequirements {
    /// Requirements with nothing but an idle working directory
    pub fn new(idle_working_dir: impl Into<PathBuf>) -> Self {
        Self {
            classpath: Vec::new(),
            launch_args: Vec::new(),
            env: BTreeMap::new(),
            max_memory_mb: None,
            idle_working_dir: idle_working_dir.into(),
        }
    }

    /// Append classpath entries, skipping ones already present
    pub fn with_classpath<I, P>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for entry in entries {
            let entry = entry.into();
            if !self.classpath.contains(&entry) {
                self.classpath.push(entry);
            }
        }
        self
    }

    /// Append launch options passed to the worker program
    pub fn with_launch_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_max_memory_mb(mut self, max_memory_mb: u64) -> Self {
        self.max_memory_mb = Some(max_memory_mb);
        self
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    pub fn launch_args(&self) -> &[String] {
        &self.launch_args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn max_memory_mb(&self) -> Option<u64> {
        self.max_memory_mb
    }

    pub fn idle_working_dir(&self) -> &Path {
        &self.idle_working_dir
    }

    /// Whether a worker provisioned with `self` can run work that asked for `requested`.
    ///
    /// The idle directory and environment must match exactly. The worker's
    /// classpath and launch options must include everything requested, and
    /// its memory bound must be at least the requested one. A worker without
    /// a memory bound satisfies any request.
    pub fn is_compatible_with(&self, requested: &ForkRequirements) -> bool {
        if self.idle_working_dir != requested.idle_working_dir || self.env != requested.env {
            return false;
        }

        let classpath: HashSet<&PathBuf> = self.classpath.iter().collect();
        if !requested.classpath.iter().all(|entry| classpath.contains(entry)) {
            return false;
        }

        let provisioned_options = launch_options(&self.launch_args);
        if !launch_options(&requested.launch_args)
            .iter()
            .all(|option| provisioned_options.contains(option))
        {
            return false;
        }

        match (self.max_memory_mb, requested.max_memory_mb) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(provisioned), Some(requested)) => provisioned >= requested,
        }
    }
}

/// A launch option with the value it was given, if any
type LaunchOption<'a> = (&'a str, Option<&'a str>);

/// Group launch args into options.
///
/// `--flag=value` and `--flag value` both give `("--flag", Some("value"))`.
/// A flag followed by another flag, or by nothing, stands alone, as does a
/// token that follows no flag.
fn launch_options(args: &[String]) -> HashSet<LaunchOption<'_>> {
    let mut options = HashSet::new();
    let mut args = args.iter().map(String::as_str).peekable();
    while let Some(arg) = args.next() {
        if !arg.starts_with('-') {
            options.insert((arg, None));
            continue;
        }
        if let Some((flag, value)) = arg.split_once('=') {
            options.insert((flag, Some(value)));
            continue;
        }
        let value = args.next_if(|next| !next.starts_with('-'));
        options.insert((arg, value));
    }
    options
}
