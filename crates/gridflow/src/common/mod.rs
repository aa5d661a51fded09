pub mod error;
pub mod macros;
pub mod setup;
pub mod wrapped;

pub use wrapped::WrappedRcRefCell;
