#![forbid(unsafe_code)]

pub mod app;
pub mod catalog;
pub mod cli;
pub mod descriptors;
pub mod eval;
pub mod formats;
pub mod logging;
pub mod objectives;
pub mod openai;
pub mod render;
pub mod store;
pub mod synth;
