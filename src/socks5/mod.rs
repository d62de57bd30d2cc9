pub mod codec;
pub mod relay;
pub mod session;

pub use relay::{RelayError, UdpRelay};
pub use session::{ControlSession, SessionError};
