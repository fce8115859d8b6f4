// JSON-RPC server: method dispatch over the Unix socket plus the HTTP /
// WebSocket surface.

pub mod methods;
pub mod trace;
pub mod unix;
pub mod ws;
