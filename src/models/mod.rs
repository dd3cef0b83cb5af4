pub mod assignment;
pub mod event;
pub mod probe;
pub mod proxy;

pub use assignment::*;
pub use event::*;
pub use probe::*;
pub use proxy::*;
