pub mod check;
pub mod config;
pub mod http_api;
pub mod inspect;
pub mod metrics;
pub mod retrieve;
