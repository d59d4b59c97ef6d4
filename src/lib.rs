pub mod account;
pub mod autosave;
pub mod cache;
pub mod clock;
pub mod compression;
pub mod config;
pub mod context;
pub mod facade;
pub mod learning;
pub mod logging;
pub mod models;
pub mod storage;

pub use context::AppContext;
