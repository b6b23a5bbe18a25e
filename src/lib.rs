#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod auth;
pub mod chat;
pub mod config;
pub mod demo;
pub mod gateway;
pub mod infra;
pub mod observability;
pub mod providers;
pub mod relay;
pub mod sessions;
pub mod storage;

pub use config::Config;

/// Session inspection subcommands (durable tier)
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommands {
    /// Show one session's title, owner and history
    Show {
        /// Chat session id
        id: String,
        /// Number of most recent messages to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List a user's sessions, most recently updated first
    List {
        /// Owner user id
        #[arg(long)]
        user: String,
        /// Maximum number of sessions to display
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Number of sessions to skip (for pagination)
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Delete a session's durable document and history
    Clear {
        /// Chat session id
        id: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}
