//! Environment helpers shared by every configuration section.
//!
//! Keys follow `STELLWERK_SECTION_KEY`. When `STELLWERK_PROFILE` is set (for
//! example `PROD`), each key is first looked up as `{PROFILE}_{KEY}` and falls
//! back to the unprefixed `{KEY}`.

use std::env;
use std::str::FromStr;

/// Env var naming the active profile.
pub const PROFILE_VAR: &str = "STELLWERK_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Active profile, uppercased. Empty means the default profile.
pub fn active_profile() -> String {
    env_opt(PROFILE_VAR).unwrap_or_default().to_uppercase()
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Overwrite `target` with the parsed env value, if present and parseable.
///
/// Unparseable values are logged and ignored so a typo in the environment
/// never prevents startup with otherwise valid config.
pub fn override_from_env<T: FromStr>(profile: &str, key: &str, target: &mut T) -> bool {
    let Some(raw) = profiled_env_opt(profile, key) else {
        return false;
    };
    match raw.parse::<T>() {
        Ok(v) => {
            *target = v;
            true
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            false
        }
    }
}

/// Like [`override_from_env`] for optional fields.
pub fn override_opt_from_env<T: FromStr>(profile: &str, key: &str, target: &mut Option<T>) -> bool {
    let Some(raw) = profiled_env_opt(profile, key) else {
        return false;
    };
    match raw.parse::<T>() {
        Ok(v) => {
            *target = Some(v);
            true
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            false
        }
    }
}
