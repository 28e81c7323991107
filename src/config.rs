use serde::Deserialize;
use std::path::Path;

/// Engine tuning, loadable from `engine.toml`. Every field has a default so
/// the engine runs with `EngineConfig::default()` out of the box.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of step vectors produced by one `next()` call.
    #[serde(default = "default_steps_batch")]
    pub steps_batch: usize,
    /// Fan-out degree of the coalesce exchange. Defaults to the number of
    /// available cores.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Staleness window for instant selectors, in ms.
    #[serde(default = "default_lookback_delta_ms")]
    pub lookback_delta_ms: i64,
    /// Whether the `@` timestamp modifier is accepted in queries.
    #[serde(default = "default_true")]
    pub enable_at_modifier: bool,
}

fn default_steps_batch() -> usize {
    10
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_lookback_delta_ms() -> i64 {
    300_000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            steps_batch: default_steps_batch(),
            parallelism: default_parallelism(),
            lookback_delta_ms: default_lookback_delta_ms(),
            enable_at_modifier: default_true(),
        }
    }
}

impl EngineConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.steps_batch, 10);
        assert_eq!(cfg.lookback_delta_ms, 300_000);
        assert!(cfg.parallelism >= 1);
        assert!(cfg.enable_at_modifier);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str("steps_batch = 4").unwrap();
        assert_eq!(cfg.steps_batch, 4);
        assert_eq!(cfg.lookback_delta_ms, 300_000);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let cfg = EngineConfig::load("/nonexistent/engine.toml").unwrap();
        assert_eq!(cfg.steps_batch, 10);
    }
}
