//! Enrollment-to-completion runtime for an online course platform.
//!
//! Purchases and admin grants become [`models::Enrollment`]s, learners
//! complete modules directly or by passing a linked quiz, and full
//! completion queues a pending [`models::Certificate`] for an external
//! renderer.

pub mod certificate;
pub mod config;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod grading;
pub mod ids;
pub mod models;
pub mod progress;
pub mod quiz;
pub mod routes;
pub mod runtime;
pub mod store;
pub mod test_utils;

pub use error::{CoreError, StoreError};
pub use runtime::Runtime;
