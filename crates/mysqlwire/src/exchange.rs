//! Sans-IO protocol exchanges.
//!
//! A multi-packet conversation (the handshake, a change of user) is a state
//! machine that is fed received payloads and answers with the next step. The
//! blocking and async sessions each run the same machines with their own
//! socket loop, so the protocol logic exists once.

use mysqlwire_core::Result;

/// What the driver must do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Step<T> {
    /// Send this payload as the next packet
    Send(Vec<u8>),
    /// Wait for the next packet and resume with it
    Receive,
    /// Upgrade the socket to TLS, then resume with `None`
    StartTls,
    /// The exchange finished
    Done(T),
}

/// A protocol conversation driven by packets.
pub trait Exchange {
    type Output;

    /// Advance the machine. `packet` is the payload just received, or `None`
    /// after a `Send` or `StartTls` step (and on the very first call).
    fn resume(&mut self, packet: Option<Vec<u8>>) -> Result<Step<Self::Output>>;
}
