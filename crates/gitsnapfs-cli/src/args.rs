// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;

use tracing_subscriber::prelude::*;

const GITSNAPFS_LOG: &str = "GITSNAPFS_LOG";

/// Command line flags for configuring logging.
#[derive(Debug, Clone, clap::Args)]
pub struct Logging {
    /// Make the logging more verbose, pass more than once for more
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Mirror all log output into the named file
    #[clap(long, global = true, env = "GITSNAPFS_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Logging {
    pub fn configure(&self) {
        let mut directives = match self.verbose {
            0 => std::env::var(GITSNAPFS_LOG)
                .unwrap_or_else(|_| "gitsnapfs=info,warn".to_string()),
            1 => "gitsnapfs=debug,info".to_string(),
            2 => "gitsnapfs=trace,info".to_string(),
            3 => "gitsnapfs=trace,debug".to_string(),
            _ => "trace".to_string(),
        };
        std::env::set_var(GITSNAPFS_LOG, &directives);
        if let Ok(overrides) = std::env::var("RUST_LOG") {
            directives.push(',');
            directives.push_str(&overrides);
        }
        let env_filter = tracing_subscriber::filter::EnvFilter::from(directives);
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .without_time()
            .with_target(self.verbose > 2);
        let file_layer = self.log_file.as_ref().and_then(|path| {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                ),
                Err(err) => {
                    eprintln!("WARNING: could not open log file {path:?}: {err}");
                    None
                }
            }
        });
        let sub = tracing_subscriber::Registry::default()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer);
        tracing::subscriber::set_global_default(sub).unwrap();
    }
}
