mod error;
mod local;
mod reducer;

pub use error::{ReduceErr, Result};
pub use local::{LocalGroup, LocalMember};
pub use reducer::{ReduceOp, Reducer};
