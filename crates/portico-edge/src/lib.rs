//! Edge connection handling
//!
//! Everything between `accept()` on the HTTPS port and the first byte a
//! downstream consumer sees: ClientHello peeking with byte-exact replay, the
//! synthetic listener that feeds inspected connections to the in-process
//! HTTPS server, the public-reachability probe, and the dispatcher that ties
//! them together.

pub mod dispatcher;
pub mod listener;
pub mod peek;
pub mod probe;

pub use dispatcher::{EdgeConn, EdgeDispatcher, EdgeError};
pub use listener::{PassthroughHandle, PassthroughListener};
pub use peek::{peek_client_hello, ClientHello, PeekError, ReplayedStream};
pub use probe::{check_public_address, ProbeError};
