pub mod backoff;
pub mod config;
pub mod model;
pub mod settle;
pub mod time;

pub use backoff::*;
pub use config::*;
pub use model::*;
pub use settle::*;
pub use time::*;
