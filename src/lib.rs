pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod grid;
pub mod logging;
pub mod model;
pub mod risk;
pub mod state;
pub mod ui;
