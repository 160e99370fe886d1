pub mod executor;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use executor::*;
pub use registry::*;
pub use worker::*;
