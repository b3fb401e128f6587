//! Configuration types and helpers.

mod defaults;
mod duration;
mod provider;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use duration::*;
pub use provider::*;
