pub mod adb;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod context;
pub mod device_runner;
pub mod error;
pub mod fs;
pub mod instrumentation;
pub mod logging;
pub mod models;
pub mod report;
pub mod scheduler;
pub mod sharding;
pub mod task;
