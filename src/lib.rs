pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod normalize;
pub mod organizer;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod transfer;
pub mod tui;
