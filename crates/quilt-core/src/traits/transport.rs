//! Transport seam.
//!
//! The replication core never opens connections: the embedding application
//! registers one send-capable handle per remote peer and feeds inbound
//! frames back into the engine. WebSocket, TCP, HTTP, UDP, or an in-process
//! bus all look the same from here.

use crate::errors::ReplicationError;
use crate::message::WireFrame;
use crate::peer::PeerId;

/// A send-capable handle to one remote peer.
///
/// `Send` so the handle can live on the replication service thread; the
/// implementation decides its own queueing and failure policy. Send errors
/// are logged and the message is dropped — retransmission is driven by the
/// gap protocol, not by the socket.
pub trait PeerSocket: Send {
    fn send(&self, frame: WireFrame) -> Result<(), ReplicationError>;
}

/// Fired exactly once per peer when its contiguous prefix first covers
/// everything seen from it.
pub type SyncedHook = Box<dyn FnMut(PeerId) + Send>;
