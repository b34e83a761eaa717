//! Wire-protocol front-ends sharing one mail core (SPEC §6).
//!
//! Each protocol module owns its accept loop and wire framing; all of them
//! drive the same `pv_collections::mail` session/injector/registry API, so
//! adding a protocol here never means touching the storage layer.

pub mod buffer;
pub mod engine;
pub mod http;
pub mod imap;
pub mod managesieve;
pub mod pop3;
pub mod smtp;
pub mod tls;
