//! Student dropout-risk backend.
//!
//! Teachers upload a CSV sheet of student records; each row is scored by a
//! pre-trained classifier, stored, and summarised for the dashboards.

pub mod analytics;
pub mod api;
pub mod config;
pub mod data;
pub mod database;
pub mod error;
pub mod logger;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod training;
pub mod users;

pub use error::{AppError, Result};
