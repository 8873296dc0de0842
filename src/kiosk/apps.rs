//! Applications a customer may run while kiosk mode is enabled.
//!
//! The list is persisted as `allowed_apps.json`:
//!
//! ```json
//! {
//!   "allowed_apps": {
//!     "chrome.exe": {
//!       "path": "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
//!       "args": ["--kiosk"],
//!       "autostart": false
//!     }
//!   }
//! }
//! ```
//!
//! Paths may contain `%VAR%` environment references and a single `*`
//! wildcard component (for versioned install folders such as `app-1.0.9`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::platform::common::atomic_write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedApp {
    /// Executable name used for matching, e.g. `chrome.exe`
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Launched automatically when kiosk mode is enabled
    #[serde(default)]
    pub autostart: bool,
}

impl AllowedApp {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            window_title: None,
            icon: None,
            autostart: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Lowercased process names this entry allows: its own name and the
    /// file name of its configured executable
    pub fn process_names(&self) -> Vec<String> {
        let mut names = vec![self.name.to_lowercase()];
        if let Some(file) = self.path.rsplit(['/', '\\']).next() {
            let file = file.to_lowercase();
            if !file.is_empty() && !file.contains(['*', '%']) && !names.contains(&file) {
                names.push(file);
            }
        }
        names
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// `allowed_apps` payload of a controller update: a list of entries or a
/// map keyed by name
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AllowedAppsPayload {
    List(Vec<AllowedApp>),
    Map(BTreeMap<String, AllowedApp>),
}

impl AllowedAppsPayload {
    pub fn into_apps(self) -> Vec<AllowedApp> {
        match self {
            AllowedAppsPayload::List(apps) => apps,
            AllowedAppsPayload::Map(map) => map
                .into_iter()
                .map(|(name, mut app)| {
                    app.name = name;
                    app
                })
                .collect(),
        }
    }
}

/// On-disk allowed-apps list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowedAppsFile {
    #[serde(default)]
    pub allowed_apps: BTreeMap<String, AllowedApp>,
}

impl AllowedAppsFile {
    pub fn from_apps(apps: &[AllowedApp]) -> Self {
        Self {
            allowed_apps: apps
                .iter()
                .map(|app| (app.name.clone(), app.clone()))
                .collect(),
        }
    }

    pub fn into_apps(self) -> Vec<AllowedApp> {
        AllowedAppsPayload::Map(self.allowed_apps).into_apps()
    }

    /// Load the list, falling back to the defaults when the file is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No allowed apps file at {}, using defaults", path.display());
            return Ok(Self::from_apps(&default_allowed_apps()));
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read allowed apps file: {}", path.display()))?;
        let file: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse allowed apps file: {}", path.display()))?;
        Ok(Self::from_apps(&file.into_apps()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize allowed apps")?;
        atomic_write(path, json.as_bytes())
            .with_context(|| format!("Failed to write allowed apps file: {}", path.display()))
    }

    fn key_of(&self, name: &str) -> Option<String> {
        self.allowed_apps
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<&AllowedApp> {
        self.key_of(name).and_then(|key| self.allowed_apps.get(&key))
    }

    /// Add an entry, replacing one whose name differs only in case.
    /// Returns the replaced entry.
    pub fn insert(&mut self, app: AllowedApp) -> Option<AllowedApp> {
        let previous = self.remove(&app.name);
        self.allowed_apps.insert(app.name.clone(), app);
        previous
    }

    pub fn remove(&mut self, name: &str) -> Option<AllowedApp> {
        self.key_of(name).and_then(|key| self.allowed_apps.remove(&key))
    }
}

/// Applications permitted on a fresh install
pub fn default_allowed_apps() -> Vec<AllowedApp> {
    vec![
        AllowedApp::new(
            "chrome.exe",
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        )
        .with_args(["--kiosk", "--no-first-run", "--no-default-browser-check"]),
        AllowedApp::new("firefox.exe", r"C:\Program Files\Mozilla Firefox\firefox.exe")
            .with_args(["-kiosk"]),
        AllowedApp::new("steam.exe", r"C:\Program Files (x86)\Steam\steam.exe"),
        AllowedApp::new(
            "discord.exe",
            r"C:\Users\%USERNAME%\AppData\Local\Discord\app-*\Discord.exe",
        ),
    ]
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("'{0}' is not an allowed application")]
    NotAllowed(String),

    #[error("cannot resolve path '{pattern}': {reason}")]
    Unresolved { pattern: String, reason: String },

    #[error("executable not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Replace `%NAME%` references using `lookup`. A lone `%` is kept verbatim.
pub fn expand_vars_with<F>(input: &str, lookup: F) -> Result<String, LaunchError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('%') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(len) = after.find('%') else {
            output.push_str(&rest[start..]);
            return Ok(output);
        };

        let name = &after[..len];
        if name.is_empty() {
            output.push('%');
        } else {
            let value = lookup(name).ok_or_else(|| LaunchError::Unresolved {
                pattern: input.to_string(),
                reason: format!("environment variable {name} is not set"),
            })?;
            output.push_str(&value);
        }
        rest = &after[len + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

pub fn expand_vars(input: &str) -> Result<String, LaunchError> {
    expand_vars_with(input, |name| std::env::var(name).ok())
}

/// Case-insensitive match where `*` spans any run of characters
fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let candidate = candidate.to_lowercase();
    let mut parts = pattern.split('*');

    let Some(first) = parts.next() else {
        return candidate.is_empty();
    };
    let Some(mut remainder) = candidate.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return remainder.is_empty();
    };
    for part in middle {
        match remainder.find(part) {
            Some(index) => remainder = &remainder[index + part.len()..],
            None => return false,
        }
    }
    remainder.len() >= last.len() && remainder.ends_with(last)
}

/// Expand variables and the wildcard component, returning an existing path.
///
/// When the wildcard matches several entries the lexicographically greatest
/// one wins, which picks the newest of versioned folders like `app-1.0.9`.
pub fn resolve_executable(pattern: &str) -> Result<PathBuf, LaunchError> {
    let expanded = PathBuf::from(expand_vars(pattern)?);
    let components: Vec<Component<'_>> = expanded.components().collect();

    let wildcards: Vec<usize> = components
        .iter()
        .enumerate()
        .filter(|(_, c)| c.as_os_str().to_string_lossy().contains('*'))
        .map(|(i, _)| i)
        .collect();

    let resolved = match wildcards.as_slice() {
        [] => expanded.clone(),
        [index] => {
            let base: PathBuf = components[..*index].iter().collect();
            let glob = components[*index].as_os_str().to_string_lossy().into_owned();

            let entries = std::fs::read_dir(&base).map_err(|e| LaunchError::Unresolved {
                pattern: pattern.to_string(),
                reason: format!("cannot list {}: {}", base.display(), e),
            })?;
            let best = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| wildcard_match(&glob, name))
                .max()
                .ok_or_else(|| LaunchError::Unresolved {
                    pattern: pattern.to_string(),
                    reason: format!("nothing in {} matches {}", base.display(), glob),
                })?;

            let mut path = base.join(best);
            path.extend(&components[index + 1..]);
            path
        }
        _ => {
            return Err(LaunchError::Unresolved {
                pattern: pattern.to_string(),
                reason: "only one wildcard component is supported".to_string(),
            });
        }
    };

    if !resolved.exists() {
        return Err(LaunchError::NotFound(resolved));
    }
    Ok(resolved)
}

/// Handle to an application started by the agent
#[derive(Debug)]
pub struct RunningApp {
    pub name: String,
    pub path: PathBuf,
    pub started_at: chrono::DateTime<chrono::Utc>,
    child: Child,
}

impl RunningApp {
    pub fn launch(app: &AllowedApp) -> Result<Self, LaunchError> {
        let path = resolve_executable(&app.path)?;

        info!("Launching {} from {}", app.name, path.display());
        let child = Command::new(&path)
            .args(&app.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            name: app.name.clone(),
            path,
            started_at: chrono::Utc::now(),
            child,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process and wait up to `timeout` for it to exit.
    /// Returns false if it is still running afterwards.
    pub fn terminate(&mut self, timeout: Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        if let Err(e) = self.child.kill() {
            warn!("Failed to kill {} ({}): {}", self.name, self.pid(), e);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() >= deadline => {
                    warn!("{} ({}) did not exit within {:?}", self.name, self.pid(), timeout);
                    return false;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                Err(e) => {
                    warn!("Failed to wait for {}: {}", self.name, e);
                    return false;
                }
            }
        }
    }
}
