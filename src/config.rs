//! Environment-driven configuration for draw planning and the relay server

use std::path::PathBuf;

use crate::types::MAX_SESSION_DURATION_MS;

/// Tuning for generated draw sessions
#[derive(Debug, Clone, PartialEq)]
pub struct DrawConfig {
    /// Hard floor for a spin's duration
    pub min_spin_ms: u64,
    /// Hard ceiling for a spin's duration
    pub max_spin_ms: u64,
    /// Band the random duration is drawn from (before clamping)
    pub spin_band_min_ms: u64,
    pub spin_band_max_ms: u64,
    pub min_loops: u32,
    /// Upper bound of the random loop count (before the speed floor bumps it)
    pub max_random_loops: u32,
    /// Minimum average reel speed in units per second
    pub min_speed: f64,
    /// Reference cell width used for the speed floor
    pub unit_width: f64,
    /// Delay between creating a session and its logical start
    pub start_pad_ms: u64,
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            min_spin_ms: 4_000,
            max_spin_ms: 9_000,
            spin_band_min_ms: 5_000,
            spin_band_max_ms: 7_500,
            min_loops: 4,
            max_random_loops: 7,
            min_speed: 1_800.0,
            unit_width: 120.0,
            start_pad_ms: 300,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl DrawConfig {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let d = Self::default();
        let config = Self {
            min_spin_ms: env_or("DRAW_MIN_SPIN_MS", d.min_spin_ms),
            max_spin_ms: env_or("DRAW_MAX_SPIN_MS", d.max_spin_ms),
            spin_band_min_ms: env_or("DRAW_SPIN_BAND_MIN_MS", d.spin_band_min_ms),
            spin_band_max_ms: env_or("DRAW_SPIN_BAND_MAX_MS", d.spin_band_max_ms),
            min_loops: env_or("DRAW_MIN_LOOPS", d.min_loops),
            max_random_loops: env_or("DRAW_MAX_RANDOM_LOOPS", d.max_random_loops),
            min_speed: env_or("DRAW_MIN_SPEED", d.min_speed),
            unit_width: env_or("DRAW_UNIT_WIDTH", d.unit_width),
            start_pad_ms: env_or("DRAW_START_PAD_MS", d.start_pad_ms),
        }
        .normalized();

        tracing::info!(
            min_spin_ms = config.min_spin_ms,
            max_spin_ms = config.max_spin_ms,
            min_loops = config.min_loops,
            min_speed = config.min_speed,
            start_pad_ms = config.start_pad_ms,
            "Draw config loaded"
        );
        config
    }

    /// Repair swapped or degenerate bounds so planning never panics
    pub fn normalized(mut self) -> Self {
        if self.min_spin_ms == 0 {
            self.min_spin_ms = 1;
        }
        if self.max_spin_ms < self.min_spin_ms {
            std::mem::swap(&mut self.min_spin_ms, &mut self.max_spin_ms);
        }
        self.max_spin_ms = self.max_spin_ms.min(MAX_SESSION_DURATION_MS);
        self.min_spin_ms = self.min_spin_ms.min(self.max_spin_ms);
        if self.spin_band_max_ms < self.spin_band_min_ms {
            std::mem::swap(&mut self.spin_band_min_ms, &mut self.spin_band_max_ms);
        }
        if self.max_random_loops < self.min_loops {
            self.max_random_loops = self.min_loops;
        }
        if !self.unit_width.is_finite() || self.unit_width <= 0.0 {
            self.unit_width = Self::default().unit_width;
        }
        if !self.min_speed.is_finite() || self.min_speed < 0.0 {
            self.min_speed = 0.0;
        }
        self
    }
}

/// Relay server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Snapshot file for the durable store (None = memory only)
    pub data_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env_or("LUCKYDRAW_PORT", 6574);
        let data_path = std::env::var("LUCKYDRAW_DATA_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        if data_path.is_none() {
            tracing::warn!("LUCKYDRAW_DATA_PATH not set - room state is kept in memory only");
        }
        Self { port, data_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "DRAW_MIN_SPIN_MS",
            "DRAW_MAX_SPIN_MS",
            "DRAW_MIN_LOOPS",
            "DRAW_MAX_RANDOM_LOOPS",
            "DRAW_UNIT_WIDTH",
            "LUCKYDRAW_PORT",
            "LUCKYDRAW_DATA_PATH",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        assert_eq!(DrawConfig::from_env(), DrawConfig::default());

        let server = ServerConfig::from_env();
        assert_eq!(server.port, 6574);
        assert!(server.data_path.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_and_normalizes() {
        clear_env();
        std::env::set_var("DRAW_MIN_SPIN_MS", "8000");
        std::env::set_var("DRAW_MAX_SPIN_MS", "3000");
        std::env::set_var("DRAW_MIN_LOOPS", "9");
        std::env::set_var("DRAW_MAX_RANDOM_LOOPS", "2");
        std::env::set_var("DRAW_UNIT_WIDTH", "not-a-number");

        let config = DrawConfig::from_env();
        assert_eq!(config.min_spin_ms, 3000);
        assert_eq!(config.max_spin_ms, 8000);
        assert_eq!(config.min_loops, 9);
        assert_eq!(config.max_random_loops, 9);
        assert_eq!(config.unit_width, 120.0);

        clear_env();
    }

    #[test]
    fn test_normalized_caps_spin_duration() {
        let config = DrawConfig {
            min_spin_ms: u64::MAX,
            max_spin_ms: u64::MAX,
            ..DrawConfig::default()
        }
        .normalized();
        assert_eq!(config.max_spin_ms, MAX_SESSION_DURATION_MS);
        assert_eq!(config.min_spin_ms, MAX_SESSION_DURATION_MS);
    }

    #[test]
    #[serial]
    fn test_server_config_data_path() {
        clear_env();
        std::env::set_var("LUCKYDRAW_DATA_PATH", "  /tmp/rooms.json ");
        std::env::set_var("LUCKYDRAW_PORT", "7000");

        let server = ServerConfig::from_env();
        assert_eq!(server.port, 7000);
        assert_eq!(server.data_path, Some(PathBuf::from("/tmp/rooms.json")));

        clear_env();
    }
}
