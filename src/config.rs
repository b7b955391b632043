//! Configuration loaded from environment variables at startup.
//!
//! Centralizes all HEARTH_* env var access into a single Config struct,
//! providing a single source of truth with fail-fast validation.

use std::path::PathBuf;
use std::sync::Mutex;

/// Global configuration instance, lazily initialized and resettable for tests.
static CONFIG: Mutex<Option<Config>> = Mutex::new(None);

/// Configuration loaded from HEARTH_* environment variables.
///
/// All environment variable access should go through this struct
/// rather than calling env::var directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Scratch directory (HEARTH_DIR or ./.hearth)
    pub hearth_dir: PathBuf,
    /// Supervisor socket path (HEARTH_SOCK or ./.hearth.sock)
    pub socket_path: PathBuf,
    /// Plan file path (HEARTH_PLAN or ./hearth.json)
    pub plan_path: PathBuf,
    /// Debug flag (HEARTH_DEBUG=1)
    pub debug: bool,
}

impl Config {
    /// Initialize global config from environment variables (call once at startup).
    /// Can be called multiple times - subsequent calls are no-ops.
    pub fn init() {
        let mut config = CONFIG.lock().unwrap();
        if config.is_none() {
            *config = Some(Self::from_env());
        }
    }

    /// Get reference to global config (must call init() first).
    /// Panics if init() was not called.
    pub fn get() -> Config {
        CONFIG
            .lock()
            .unwrap()
            .clone()
            .expect("Config::init() must be called before Config::get()")
    }

    /// Like get(), but returns None before init. Used by logging, which may
    /// run from contexts (tests, panics) where startup order isn't guaranteed.
    pub fn try_get() -> Option<Config> {
        CONFIG.lock().unwrap().clone()
    }

    /// True when HEARTH_DEBUG=1. Safe to call before init (returns false).
    pub fn debug_enabled() -> bool {
        CONFIG.lock().unwrap().as_ref().map(|c| c.debug).unwrap_or(false)
    }

    /// Reset global config (test-only).
    /// Allows tests to reinitialize config with different env vars.
    #[cfg(test)]
    pub fn reset() {
        *CONFIG.lock().unwrap() = None;
    }

    /// Load configuration from environment variables
    fn from_env() -> Self {
        use std::env;

        // HEARTH_DIR: scratch directory, defaults to .hearth in the project
        let hearth_dir = env::var("HEARTH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".hearth"));

        // HEARTH_SOCK: well-known socket, project-local by default so several
        // projects can run supervisors side by side
        let socket_path = env::var("HEARTH_SOCK")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".hearth.sock"));

        // HEARTH_PLAN: tree description for the binary
        let plan_path = env::var("HEARTH_PLAN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("hearth.json"));

        // HEARTH_DEBUG: boolean flag (true if "1")
        let debug = env::var("HEARTH_DEBUG").map(|v| v == "1").unwrap_or(false);

        Self {
            hearth_dir,
            socket_path,
            plan_path,
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to set env var for test scope
    fn with_env<F>(key: &str, value: &str, f: F)
    where
        F: FnOnce(),
    {
        // SAFETY: Tests use serial_test to run single-threaded.
        // No data races possible when tests run serially.
        unsafe {
            env::set_var(key, value);
        }
        f();
        unsafe {
            env::remove_var(key);
        }
    }

    /// Helper to remove env vars for test scope
    fn clear_env(keys: &[&str]) {
        for key in keys {
            // SAFETY: serial tests, see with_env
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults_are_project_local() {
        clear_env(&["HEARTH_DIR", "HEARTH_SOCK", "HEARTH_PLAN", "HEARTH_DEBUG"]);
        Config::reset();
        Config::init();
        let config = Config::get();
        assert_eq!(config.hearth_dir, PathBuf::from(".hearth"));
        assert_eq!(config.socket_path, PathBuf::from(".hearth.sock"));
        assert_eq!(config.plan_path, PathBuf::from("hearth.json"));
        assert!(!config.debug);
    }

    #[test]
    #[serial]
    fn test_socket_override() {
        with_env("HEARTH_SOCK", "/tmp/custom.sock", || {
            Config::reset();
            Config::init();
            assert_eq!(Config::get().socket_path, PathBuf::from("/tmp/custom.sock"));
        });
        Config::reset();
    }

    #[test]
    #[serial]
    fn test_debug_flag_requires_exact_one() {
        with_env("HEARTH_DEBUG", "1", || {
            Config::reset();
            Config::init();
            assert!(Config::get().debug);
        });
        with_env("HEARTH_DEBUG", "true", || {
            Config::reset();
            Config::init();
            assert!(!Config::get().debug);
        });
        Config::reset();
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        clear_env(&["HEARTH_DIR"]);
        Config::reset();
        Config::init();
        with_env("HEARTH_DIR", "/tmp/should-not-see", || {
            Config::init(); // no-op, already initialized
            assert_eq!(Config::get().hearth_dir, PathBuf::from(".hearth"));
        });
        Config::reset();
    }
}
