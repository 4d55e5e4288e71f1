//! Pipeline CLI commands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Parse a status string the way dashboards and notifiers do
    ///
    /// Examples:
    ///   steprail status running:create_plan
    ///   steprail status "gate:approve" --json
    Status {
        /// Status string, `phase` or `phase:step`
        status: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Validate a pipeline manifest without running it
    Validate {
        /// Path to the YAML manifest
        manifest: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run the steps of a pipeline manifest
    ///
    /// Gated steps prompt for approval on stdin unless --auto-approve is
    /// given. Every finished step is checkpointed; Ctrl+C cancels the run.
    Run {
        /// Path to the YAML manifest
        manifest: PathBuf,

        /// Identifier to store snapshots under (default: random UUID)
        #[arg(long)]
        run_id: Option<String>,

        /// Approve every gate without prompting
        #[arg(long)]
        auto_approve: bool,
    },

    /// Resume a checkpointed run
    Resume {
        /// Run identifier given or printed by `run`
        run_id: String,

        /// Manifest the run was started from
        manifest: PathBuf,

        /// Approve every gate without prompting
        #[arg(long)]
        auto_approve: bool,
    },

    /// Show the stored snapshot of a run
    Inspect {
        /// Run identifier
        run_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List stored runs, most recent first
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete the stored snapshot of a run
    Forget {
        /// Run identifier
        run_id: String,
    },
}
