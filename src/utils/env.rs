// src/utils/env.rs
use env_logger::{Builder, Env};
use log::{debug, info};

fn logger_builder(filter_var: &str) -> Builder {
    Builder::from_env(Env::default().filter(filter_var.to_string()))
}

/// Loads variables from `.env` (if present) without overriding ones already
/// set, then installs the global logger. `.env` may carry `RUST_LOG`, so the
/// file is read first.
pub fn init_env_and_logging() {
    let loaded = dotenv::dotenv();
    logger_builder("RUST_LOG").init();
    match loaded {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => debug!("No .env file loaded ({}); using process environment", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::LevelFilter;

    #[test]
    fn test_log_level_from_env_file_reaches_logger() {
        let path = std::env::temp_dir().join(format!("lead_dedup_{}.env", std::process::id()));
        std::fs::write(&path, "DEDUP_TEST_LOG_FILTER=debug\n").unwrap();
        dotenv::from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let logger = logger_builder("DEDUP_TEST_LOG_FILTER").build();
        assert_eq!(logger.filter(), LevelFilter::Debug);
    }
}
