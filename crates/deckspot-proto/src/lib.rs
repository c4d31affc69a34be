pub mod config;
pub mod events;
pub mod library;
pub mod platform;
pub mod playback;
pub mod settings;
