pub use anyhow::Context;
pub use tracing::{debug, debug_span, error, info, instrument, trace, warn};
