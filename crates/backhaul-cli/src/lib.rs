//! Backhaul command-line support: config files and flag parsing

pub mod config;
