//! Config interpolation, deep merge, and redaction.
//!
//! The sidecar receives its configuration record over the wire and from the
//! process environment; string values may reference secrets as `{env:VAR}`
//! or `{file:path}`. Resolution is allowlisted on both axes: env names must
//! match a compiled pattern set, file targets must live inside an approved
//! directory, must not be symlinks, and must carry tight permissions.
//! Redaction guarantees that anything which ever held an interpolation
//! token - or sits under a sensitive key - never reaches a log line.

use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Sentinel shown in redacted copies.
pub const REDACTED: &str = "***REDACTED***";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable '{0}' is not in the allowlist")]
    EnvNotAllowed(String),
    #[error("environment variable '{0}' is not set")]
    EnvNotSet(String),
    #[error("secret file '{0}' is not inside an allowed directory")]
    FileOutsideAllowed(PathBuf),
    #[error("secret file is a symlink: {0}")]
    Symlink(PathBuf),
    #[error("secret file not found or not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("secret file not owned by current user: {0}")]
    BadOwner(PathBuf),
    #[error("secret file '{path}' has unsafe permissions {mode:o} (must be <= 0640)")]
    UnsafeMode { path: PathBuf, mode: u32 },
    #[error("io error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Compiled patterns
// ---------------------------------------------------------------------------

fn interp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(env|file):([^}]+)\}").expect("static regex"))
}

fn sensitive_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(auth|key|secret|token|password|credential|bearer)")
            .expect("static regex")
    })
}

fn core_env_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^LOA_",
            r"^OPENAI_API_KEY$",
            r"^ANTHROPIC_API_KEY$",
            r"^MOONSHOT_API_KEY$",
            r"^CHEVAL_",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

// ---------------------------------------------------------------------------
// Resolution options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Root used to anchor relative `{file:...}` references and the default
    /// allowed directory `<root>/.cheval.config.d`.
    pub project_root: PathBuf,
    /// Extra env-name patterns beyond the core allowlist.
    pub extra_env_patterns: Vec<Regex>,
    /// Extra directories secret files may be read from.
    pub allowed_file_dirs: Vec<PathBuf>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            extra_env_patterns: Vec::new(),
            allowed_file_dirs: Vec::new(),
        }
    }
}

fn env_allowed(name: &str, opts: &ResolveOptions) -> bool {
    core_env_patterns().iter().any(|p| p.is_match(name))
        || opts.extra_env_patterns.iter().any(|p| p.is_match(name))
}

// ---------------------------------------------------------------------------
// File safety
// ---------------------------------------------------------------------------

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

#[cfg(unix)]
fn check_owner_and_mode(path: &Path, meta: &std::fs::Metadata) -> Result<(), ConfigError> {
    use std::os::unix::fs::MetadataExt;

    // SAFETY: getuid is always safe to call.
    let uid = unsafe { libc::getuid() };
    if meta.uid() != uid {
        return Err(ConfigError::BadOwner(path.to_path_buf()));
    }
    let mode = meta.mode() & 0o777;
    if mode & 0o137 != 0 {
        return Err(ConfigError::UnsafeMode {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_and_mode(_path: &Path, _meta: &std::fs::Metadata) -> Result<(), ConfigError> {
    Ok(())
}

/// Validate a `{file:...}` reference and return the resolved path.
fn check_file_allowed(reference: &str, opts: &ResolveOptions) -> Result<PathBuf, ConfigError> {
    let raw = Path::new(reference);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        opts.project_root.join(raw)
    };

    // Symlink rejection happens twice: once on the path as given and once
    // on the resolved target.
    if is_symlink(&joined) {
        return Err(ConfigError::Symlink(joined));
    }

    let resolved = joined
        .canonicalize()
        .map_err(|_| ConfigError::NotAFile(joined.clone()))?;

    let mut allowed = vec![opts.project_root.join(".cheval.config.d")];
    allowed.extend(opts.allowed_file_dirs.iter().cloned());

    let in_allowed = allowed.iter().any(|dir| {
        dir.canonicalize()
            .map(|d| resolved.starts_with(&d))
            .unwrap_or(false)
    });
    if !in_allowed {
        return Err(ConfigError::FileOutsideAllowed(resolved));
    }

    if is_symlink(&resolved) {
        return Err(ConfigError::Symlink(resolved));
    }

    let meta = std::fs::metadata(&resolved).map_err(|source| ConfigError::Io {
        path: resolved.clone(),
        source,
    })?;
    if !meta.is_file() {
        return Err(ConfigError::NotAFile(resolved));
    }
    check_owner_and_mode(&resolved, &meta)?;

    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Resolve `{env:VAR}` and `{file:path}` tokens inside a single string.
pub fn interpolate_value(value: &str, opts: &ResolveOptions) -> Result<String, ConfigError> {
    let re = interp_re();
    let mut out = String::with_capacity(value.len());
    let mut last = 0;

    for caps in re.captures_iter(value) {
        let whole = caps.get(0).expect("match");
        out.push_str(&value[last..whole.start()]);
        let kind = &caps[1];
        let reference = &caps[2];

        match kind {
            "env" => {
                if !env_allowed(reference, opts) {
                    return Err(ConfigError::EnvNotAllowed(reference.to_string()));
                }
                let resolved = std::env::var(reference)
                    .map_err(|_| ConfigError::EnvNotSet(reference.to_string()))?;
                out.push_str(&resolved);
            }
            "file" => {
                let path = check_file_allowed(reference, opts)?;
                let contents =
                    std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                out.push_str(contents.trim());
            }
            _ => unreachable!("regex only matches env|file"),
        }
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

/// Recursively resolve interpolation tokens through objects and arrays.
pub fn interpolate_config(config: &Value, opts: &ResolveOptions) -> Result<Value, ConfigError> {
    match config {
        Value::String(s) if interp_re().is_match(s) => {
            Ok(Value::String(interpolate_value(s, opts)?))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), interpolate_config(value, opts)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_config(item, opts)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Deep merge
// ---------------------------------------------------------------------------

/// Deep-merge `overlay` into `base`: objects merge recursively, every other
/// type is replaced by the overlay value. Neither input is modified.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut out = base_map.clone();
            for (key, value) in overlay_map {
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => overlay.clone(),
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Produce a redacted copy of an (uninterpolated) config for display.
///
/// Values containing interpolation tokens become the sentinel annotated with
/// the token source; values under sensitive keys are redacted regardless.
pub fn redact_config(config: &Value) -> Value {
    match config {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let redacted = match value {
                    Value::Object(_) | Value::Array(_) => redact_config(value),
                    Value::String(s) if interp_re().is_match(s) => {
                        let sources: Vec<String> = interp_re()
                            .captures_iter(s)
                            .map(|c| format!("{}:{}", &c[1], &c[2]))
                            .collect();
                        Value::String(format!("{} (from {})", REDACTED, sources.join(", ")))
                    }
                    _ if sensitive_key_re().is_match(key) => Value::String(REDACTED.into()),
                    other => other.clone(),
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_config).collect()),
        other => other.clone(),
    }
}

/// Redact sensitive header values by name.
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            if sensitive_key_re().is_match(name) {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(Authorization:\s*Bearer\s+)\S+").expect("static regex"))
}

fn api_key_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(x-api-key:\s*)\S+").expect("static regex"))
}

/// Strip known secret values and auth headers out of an arbitrary string
/// before it reaches a log line or an error message.
pub fn redact_string(input: &str) -> String {
    let mut result = input.to_string();

    for var in ["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "MOONSHOT_API_KEY"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() && result.contains(&value) {
                result = result.replace(&value, REDACTED);
            }
        }
    }
    for (name, value) in std::env::vars() {
        if name.starts_with("LOA_") && value.len() > 8 && result.contains(&value) {
            result = result.replace(&value, REDACTED);
        }
    }

    let replacement = format!("${{1}}{REDACTED}");
    result = bearer_re().replace_all(&result, replacement.as_str()).into_owned();
    result = api_key_header_re()
        .replace_all(&result, replacement.as_str())
        .into_owned();
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
