mod config;
mod device;
mod exchange;
mod gate;
mod rate;
mod runtime;
mod session;
mod sink;
mod source;
mod stats;

pub mod synthetic;

pub use config::*;
pub use device::*;
pub use exchange::*;
pub use gate::*;
pub use rate::*;
pub use runtime::*;
pub use session::*;
pub use sink::*;
pub use source::*;
pub use stats::*;
