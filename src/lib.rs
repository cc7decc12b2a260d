pub mod cli;
pub mod core;
pub mod interfaces;
pub mod logging;
pub mod platform;
pub mod plugins;
