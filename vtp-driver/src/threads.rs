pub mod status_sender;

pub use self::status_sender::status_sender;
pub use self::status_sender::StatusSampler;
