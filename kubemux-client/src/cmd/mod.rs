pub mod log_session;
pub mod portforward;
