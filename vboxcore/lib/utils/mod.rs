//! Utility functions and types.

mod file;
mod locks;
mod net;
mod retry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use file::*;
pub use locks::*;
pub use net::*;
pub use retry::*;
