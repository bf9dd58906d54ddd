pub mod ari;
pub mod call_service;
pub mod config;
pub mod error;
pub mod recorder;
pub mod worker;
