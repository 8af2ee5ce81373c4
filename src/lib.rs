pub mod chart;
pub mod cli;
pub mod client;
pub mod commands;
pub mod constants;
pub mod grid;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod session;
