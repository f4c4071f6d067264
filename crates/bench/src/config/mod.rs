mod loader;
mod types;

pub use loader::SyntheticOptions;
pub use types::*;
