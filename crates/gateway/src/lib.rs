//! WebSocket gateway: multiplexes broker pub/sub plus an on-connect DOM
//! snapshot to many interactive clients, and serves the REST history
//! surface.

pub mod api;
pub mod client;
pub mod protocol;
pub mod router;
pub mod ws_server;

pub use api::{rest_router, ApiState};
pub use client::{ClientRegistry, ClientState, Frame, SendQueue};
pub use protocol::{Channel, CLOSE_UNKNOWN_CHANNEL, CLOSE_UNRESPONSIVE};
pub use router::Router;
pub use ws_server::{ws_handler, WsState, SEND_QUEUE_CAPACITY};
