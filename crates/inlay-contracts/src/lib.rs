pub mod config;
pub mod error;
pub mod events;
pub mod geometry;
pub mod prompt;
pub mod selection;
