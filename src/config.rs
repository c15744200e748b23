//! Manager configuration.

use serde::Deserialize;
use tracing::warn;

const DEFAULT_LOCAL_LOADERS: usize = 4;
const DEFAULT_REMOTE_LOADERS: usize = 8;
const MAX_LOADERS: usize = 100;

const LOCAL_LOADERS_ENV: &str = "TEXTURE_LOCAL_LOADERS";
const REMOTE_LOADERS_ENV: &str = "TEXTURE_REMOTE_LOADERS";

/// Sizing of the two loader pools. Loader threads are created lazily, so
/// these are upper bounds rather than eagerly spawned threads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextureManagerConfig {
    pub local_loader_count: usize,
    pub remote_loader_count: usize,
}

impl Default for TextureManagerConfig {
    fn default() -> Self {
        Self {
            local_loader_count: DEFAULT_LOCAL_LOADERS,
            remote_loader_count: DEFAULT_REMOTE_LOADERS,
        }
    }
}

impl TextureManagerConfig {
    /// Reads pool sizes from `TEXTURE_LOCAL_LOADERS` and
    /// `TEXTURE_REMOTE_LOADERS`. Missing or malformed values fall
    /// back to the defaults; values above 100 are clamped.
    pub fn from_env() -> Self {
        Self {
            local_loader_count: read_env(LOCAL_LOADERS_ENV, DEFAULT_LOCAL_LOADERS),
            remote_loader_count: read_env(REMOTE_LOADERS_ENV, DEFAULT_REMOTE_LOADERS),
        }
    }

    /// Applies the bounds also used by [`from_env`](Self::from_env): at least
    /// one loader per pool, at most 100.
    pub fn clamped(mut self) -> Self {
        self.local_loader_count = self.local_loader_count.clamp(1, MAX_LOADERS);
        self.remote_loader_count = self.remote_loader_count.clamp(1, MAX_LOADERS);
        self
    }
}

fn read_env(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 => n.min(MAX_LOADERS),
            _ => {
                warn!(var, value = %raw, "ignoring invalid loader count");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TextureManagerConfig::default();
        assert_eq!(cfg.local_loader_count, 4);
        assert_eq!(cfg.remote_loader_count, 8);
    }

    #[test]
    fn env_override_applies() {
        unsafe { std::env::set_var(LOCAL_LOADERS_ENV, "2") };
        let cfg = TextureManagerConfig::from_env();
        assert_eq!(cfg.local_loader_count, 2);
        unsafe { std::env::remove_var(LOCAL_LOADERS_ENV) };
    }

    #[test]
    fn malformed_env_falls_back_to_default() {
        unsafe { std::env::set_var(REMOTE_LOADERS_ENV, "many") };
        let cfg = TextureManagerConfig::from_env();
        assert_eq!(cfg.remote_loader_count, DEFAULT_REMOTE_LOADERS);
        unsafe { std::env::remove_var(REMOTE_LOADERS_ENV) };
    }

    #[test]
    fn clamps_to_upper_bound() {
        let cfg = TextureManagerConfig {
            local_loader_count: 5000,
            remote_loader_count: 0,
        }
        .clamped();
        assert_eq!(cfg.local_loader_count, MAX_LOADERS);
        assert_eq!(cfg.remote_loader_count, 1);
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: TextureManagerConfig = serde_yaml::from_str("local_loader_count: 6").unwrap();
        assert_eq!(cfg.local_loader_count, 6);
        assert_eq!(cfg.remote_loader_count, DEFAULT_REMOTE_LOADERS);
    }
}
