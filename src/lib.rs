pub mod app;
pub mod approval;
pub mod audit;
pub mod cli;
pub mod config;
pub mod cron;
pub mod demo;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod ui;
pub mod watcher;
