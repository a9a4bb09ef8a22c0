// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "taskmux",
    about = "Agent orchestration core: subagent dispatch, credential rotation, and a terminal line editor",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a subagent task batch from a JSON or YAML file and print the
    /// results.
    ///
    /// The file holds a single `TaskBatch`: the agent persona to dispatch
    /// against, an optional shared context string, and a list of tasks each
    /// with an id, description, and assignment. See `credentials status` to
    /// check that the configured model provider has usable credentials
    /// before running a batch.
    RunBatch {
        /// Path to the task batch file (`.json`, `.yaml`, or `.yml`).
        file: PathBuf,
    },

    /// Inspect and override stored model-provider credentials.
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommands,
    },

    /// Minimal raw-mode REPL exercising the line editor core: type into the
    /// terminal, press Enter on a non-slash line to submit, and the
    /// resulting buffer is printed. Ctrl-C exits.
    EditDemo,
}

#[derive(Subcommand, Debug)]
pub enum CredentialsCommands {
    /// List every stored credential, secrets redacted.
    List,
    /// Show rotation state (blocked / session-affinity) for one provider.
    Status {
        /// Provider id, e.g. "openai" or "anthropic".
        provider: String,
    },
    /// Force a provider to use a specific key, bypassing rotation entirely,
    /// until cleared with `clear-override`. Persisted so it survives across
    /// invocations.
    SetOverride {
        /// Provider id, e.g. "openai" or "anthropic".
        provider: String,
        /// The API key to use unconditionally for this provider.
        key: String,
    },
    /// Remove a previously set override for a provider.
    ClearOverride {
        /// Provider id, e.g. "openai" or "anthropic".
        provider: String,
    },
}
