pub mod backend;
pub mod config;
pub mod context;
pub mod contexts;
pub mod internals;
pub mod resources;
