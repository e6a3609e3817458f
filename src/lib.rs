pub mod cli;
pub mod diff;
pub mod error;
pub mod merge;
pub mod policy;
