//! The webs HTTP service: owner-scoped resources plus the bridge that turns
//! external workflow runs into persisted, streamable work item status.

pub mod api;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod models;
pub mod runner;
pub mod server;
pub mod stream;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;
