pub mod codec;
pub mod engine;

pub use engine::{ProtocolEngine, ProtocolError};
