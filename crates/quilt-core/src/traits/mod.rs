pub mod transport;

pub use transport::{PeerSocket, SyncedHook};
