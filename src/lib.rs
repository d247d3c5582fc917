pub mod catalog;
pub mod config;
pub mod environments;
pub mod flows;
pub mod http;
pub mod workspace;
