//! # chatrelay
//!
//! A multi-user chat relay: clients authenticate over TCP, then exchange
//! broadcast, unicast, multicast (group), and file-transfer messages through
//! a central server.
//!
//! This library holds the wire protocol shared by server and clients:
//! length-prefixed framing, the authentication and message grammar, and the
//! credential hashing function. The server itself lives in the
//! `chatrelay-server` binary.

pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{AuthMode, AuthRequest, ClientMessage};
