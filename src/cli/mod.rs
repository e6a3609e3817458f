pub mod args;
pub mod loader;

pub use args::{Args, Command, OutputFormat};
pub use loader::{PolicyLoader, render};
