// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal CLI wrapper so the library can run as a stand-alone gateway.
//!
//!  Build it with `cargo build --release --bin fallgate`
//!  The binary honours FALLGATE_CONFIG_FILE or falls back to /etc/fallgate/config.toml.

use std::env;
use std::error::Error;
use std::path::Path;

use fallgate::{Gateway, error_fmt, info_fmt};

const DEFAULT_CONFIG_PATH: &str = "/etc/fallgate/config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Starting fallgate");

    let path = match env::var("FALLGATE_CONFIG_FILE") {
        Ok(path) => {
            println!("Using configuration from {path}");
            path
        }
        Err(_) => {
            println!(
                "No FALLGATE_CONFIG_FILE env var found. Attempting to use default configuration path: {DEFAULT_CONFIG_PATH}"
            );
            if !Path::new(DEFAULT_CONFIG_PATH).exists() {
                println!("Default configuration file {DEFAULT_CONFIG_PATH} does not exist.");
                return Err(Box::from("No configuration file found."));
            }
            DEFAULT_CONFIG_PATH.to_string()
        }
    };

    // Environment variables override the file.
    let gateway = match Gateway::loader()
        .with_config_file(&path)
        .with_env_vars()
        .build()
        .await
    {
        Ok(gateway) => gateway,
        Err(e) => {
            println!("Failed to build gateway: {e}");
            return Err(e.into());
        }
    };

    match gateway.start().await {
        Ok(()) => {
            info_fmt!("fallgate", "Gateway stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error_fmt!("fallgate", "Gateway failed: {}", e);
            Err(e.into())
        }
    }
}
