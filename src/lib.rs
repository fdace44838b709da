//! Depflow - a reminder-driven service that keeps dependency update pull
//! requests flowing between repositories.
//!
//! Builds published to a channel fan out to the subscriptions listening on
//! it. Each subscription's pull request is owned by one updater, driven by
//! work items and durable reminders, and merged once its merge policies
//! pass. Code flow between product repositories and the VMR goes through
//! the same machinery.

pub mod backflow;
pub mod codeflow;
pub mod config;
pub mod description;
pub mod git;
pub mod github;
pub mod manifest;
pub mod policy;
pub mod remote;
pub mod resolver;
pub mod server;
pub mod store;
pub mod trigger;
pub mod types;
pub mod updater;
pub mod worker;

#[cfg(test)]
pub mod test_utils;
