mod json;
mod summary;
mod types;

pub use types::*;
