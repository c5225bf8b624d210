pub mod ads;
pub mod config;
