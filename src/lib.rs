pub mod config;
pub mod correlate;
pub mod error;
pub mod key;
pub mod output;
pub mod pipeline;
pub mod source;
