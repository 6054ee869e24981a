// Library root
// -----------
// This crate exposes the pieces of the Drive compression tool so the binary
// (`main.rs`) stays a thin driver and the migration logic can be tested
// against an in-memory storage.
//
// Module responsibilities:
// - `api`: the `Storage` capability trait and the blocking Drive client.
// - `auth`: cached OAuth token handling and the browser authorization flow.
// - `config`: environment-driven settings.
// - `filter`: the candidate name predicate and its Drive query rendering.
// - `migrate`: the download, compress and replace loop.
// - `archive`: single-file tar.gz creation.
// - `workspace`: the local scratch directory and artifact names.
// - `ui`: size/ratio formatting, spinners and prompts.
pub mod api;
pub mod archive;
pub mod auth;
pub mod config;
pub mod filter;
pub mod migrate;
pub mod ui;
pub mod workspace;
