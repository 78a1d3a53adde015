//! BUDP sessions over non-blocking UDP.
//!
//! A [`Registry`] owns a fixed number of session slots. Each slot is driven
//! by repeated calls to [`Registry::update`], which performs at most one
//! receive attempt and never blocks:
//!
//! ```no_run
//! use budp_session::{Message, Registry, SessionHandle};
//!
//! # fn main() -> budp_common::Result<()> {
//! let mut registry = Registry::init("CLIENT_SECRET_SEED")?;
//! let h = SessionHandle::new(0);
//! registry.open(h, 0);
//! registry.request_encryption(h);
//! registry.connect(h, "127.0.0.1", 8080);
//!
//! loop {
//!     match registry.update(h) {
//!         Some(Message::Connected) => {
//!             registry.send(h, b"Hello Server!");
//!         }
//!         Some(Message::Application(data)) => println!("{:?}", data),
//!         Some(_) => break,
//!         None => std::thread::sleep(std::time::Duration::from_millis(10)),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod handshake;
pub mod liveness;
pub mod registry;
pub mod session;
pub mod transport;

pub use registry::{Registry, SessionHandle, SharedRegistry};
pub use session::{EncryptionFlags, Message, Role, SessionState};
pub use transport::{Transport, UdpTransport};
