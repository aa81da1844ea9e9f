pub mod changes;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod io;
pub mod matcher;
pub mod paths;
pub mod pattern;
pub mod queue;
pub mod report;
pub mod resolver;
pub mod rules;
pub mod shell;
pub mod snapshot;
pub mod template;

pub use error::{PolicyError, Result};
