pub mod batch;
pub mod reading;
pub mod session_key;

pub use batch::Batch;
pub use reading::{MotionSample, Reading};
pub use session_key::{format_timestamp, is_safe_session_key, SessionKeyGenerator};
