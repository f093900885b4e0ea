pub mod message;
pub mod reliable_session;
pub mod transport;
