//! Local proxy internals: the syncer, the syncing transport, and the local
//! HTTP server. Split out of the binary for integration testing.

pub mod server;
pub mod syncer;
pub mod transport;
