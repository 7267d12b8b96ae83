//! Encrypted tunnel protocol.
//!
//! A session is a TCP stream carrying, per direction:
//!
//! ```text
//! ┌──────────┬──────────────────────┬──────────────────────┬─────┐
//! │ salt     │ [len+tag][addr+tag]  │ [len+tag][data+tag]  │ ... │
//! │ (clear)  │ first chunk          │ payload chunks       │     │
//! └──────────┴──────────────────────┴──────────────────────┴─────┘
//! ```
//!
//! The salt length equals the cipher's key length. The subkey for each
//! direction is HKDF-SHA1(master key, salt, "ss-subkey"); nonces are
//! 12-byte little-endian counters starting at zero. Only the client's first
//! chunk carries the destination address.

mod address;
mod client;
mod frame;
mod server;
mod stream;

pub use address::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
pub use client::{TunnelClient, TunnelConfig, DEFAULT_AUTH_GRACE};
pub use frame::{FrameDecoder, FrameEncoder, LENGTH_BLOCK, MAX_PAYLOAD};
pub use server::{TunnelServer, TunnelServerConfig};
pub use stream::{TunnelReader, TunnelState, TunnelStream, TunnelWriter};
