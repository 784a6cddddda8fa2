pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod repository;
pub mod state;
pub mod storage;
pub mod utils;
