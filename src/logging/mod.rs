// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging for the gateway.
//!
//! Plain `env_logger` output by default; slog (terminal or JSON) when
//! `proxy.logging.structured` is set.  Either way, code logs through the
//! `log` facade, usually via the `*_fmt!` macros from [`wrapper`].

pub mod config;
pub mod middleware;
pub mod structured;
#[cfg(test)]
pub mod test_logger;
pub mod wrapper;


use log::{LevelFilter, info};
use std::sync::{Mutex, Once, PoisonError};

use crate::logging::config::LoggingConfig;
use crate::logging::structured::{LoggerGuard, init_global_logger};

static INIT: Once = Once::new();
static GUARD: Mutex<Option<LoggerGuard>> = Mutex::new(None);

/// Initialise logging from configuration. Only the first call installs a
/// backend; every call updates the global max level.
pub fn init_with_config(level: LevelFilter, config: &LoggingConfig) {
    INIT.call_once(|| {
        if config.structured {
            let guard = init_global_logger(&config.to_logger_config());
            *GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

            let _ = slog_stdlog::init();
        } else {
            let _ = env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .format_timestamp_millis()
                .format_target(true)
                .try_init();
        }
    });

    log::set_max_level(level);
    info!("Logging initialized at level: {}", level);
}
