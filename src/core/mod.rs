pub mod config;
pub mod error;
pub mod io;
pub mod repository;
pub mod state;
