//! ttymux server: axum HTTP + WebSocket front end, registry-driven request routing,
//! reverse proxy to ttyd workers, and the unix control socket.

mod control_channel;
mod portal;
mod proxy;
mod router;
mod web_server;

pub use web_server::run_daemon;
