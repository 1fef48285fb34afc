pub mod config;
pub mod error;
pub mod pool;

mod bigvalue;
mod bucket;
mod cache;
mod iterator;
mod snapshot;
mod ttl;

pub use cache::{Cache, Stats};
pub use config::Config;
pub use error::{Error, Result};
pub use iterator::{CacheIterator, Entry};
