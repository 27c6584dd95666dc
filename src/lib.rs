#[macro_use]
extern crate tracing;

pub mod backend;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod context;
pub mod digest;
pub mod errors;
pub mod fs;
pub mod git;
pub mod pipeline;
pub mod preflight;
pub mod push;
pub mod registry;
pub mod sign;
pub mod validation;
