pub mod args;
pub mod commands;
pub mod config;

// Re-export commonly used items
pub use args::{Cli, Commands, RunArgs};
pub use commands::execute_command;
