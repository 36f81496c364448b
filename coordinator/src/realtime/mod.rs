//! Push notifications for QR payment requests.

pub mod channel;
pub mod stomp;
pub mod transport;

pub use channel::{StatusChannel, TerminalHandler};
pub use transport::{PushStream, PushTransport, StompTransport};
