pub mod application_state;
pub mod capture;
pub mod classification;
pub mod cli;
pub mod config;
pub mod consts;
pub mod errors;
pub mod flow;
pub mod histogram;
pub mod loader;
pub mod merger;
pub mod report;
pub mod settings;
pub mod storage;
pub mod top_rates;
