use k8s_openapi::serde_json::{self, Value};
use regex::Regex;
use std::str::FromStr;

pub const DEFAULT_LEVEL_KEYS: &[&str] = &["level", "severity"];

/// Severity of a log line, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" | "information" | "notice" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" | "err" | "fatal" | "critical" | "crit" | "panic" => Ok(Level::Error),
            other => Err(format!("unknown level `{}`", other)),
        }
    }
}

/// Classify a JSON log line by the first of `keys` holding a known level.
pub fn classify(line: &str, keys: &[String]) -> Option<Level> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }

    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(trimmed) else {
        return None;
    };

    keys.iter()
        .filter_map(|key| fields.get(key))
        .find_map(|value| value.as_str().and_then(|s| s.parse().ok()))
}

/// Per-line filtering applied before a log line is emitted.
///
/// Order: classify the line, drop it when it is below `threshold`, then apply
/// `pattern` (kept on match, or on mismatch when `invert` is set).
/// Lines that cannot be classified always pass the threshold.
#[derive(Clone, Debug)]
pub struct LineFilter {
    pub threshold: Option<Level>,
    pub pattern: Option<Regex>,
    pub invert: bool,
    pub level_keys: Vec<String>,
}

impl Default for LineFilter {
    fn default() -> Self {
        Self {
            threshold: None,
            pattern: None,
            invert: false,
            level_keys: DEFAULT_LEVEL_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl LineFilter {
    pub fn keep(&self, line: &str) -> bool {
        if let Some(threshold) = self.threshold {
            if classify(line, &self.level_keys).is_some_and(|level| level < threshold) {
                return false;
            }
        }

        match &self.pattern {
            Some(pattern) => pattern.is_match(line) != self.invert,
            None => true,
        }
    }
}
