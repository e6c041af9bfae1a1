pub mod outbox;
pub mod session_blob;
