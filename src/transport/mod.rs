//! Message-queue style sockets used between submitters, the Streamer,
//! worker pools and the control plane.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::{
    DEFAULT_CONNECT_TIMEOUT, PullSocket, PushSocket, ReplySocket, RequestSocket, SocketCloser,
    proxy,
};
