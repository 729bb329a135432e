//! modlink Protocol - Wire frames shared by every session variant
//!
//! This crate contains the data carried over the socket, for both remote services:
//! - Frame decoding (object-or-array JSON, case-insensitive discriminators)
//! - Twitch PubSub requests (PING, LISTEN) and response error codes
//! - Archipelago client commands (Connect, Say, LocationChecks, Get) and login strings
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde, serde_json, uuid, url and thiserror
//! 2. **No session logic** - Pure data types, builders and decoding
//! 3. **Outbound typed, inbound loose** - Requests are serde enums; inbound frames stay
//!    `serde_json` objects because servers mix casing and add fields freely

pub mod archipelago;
pub mod frame;
pub mod pubsub;

// =============================================================================
// Frame Decoding
// =============================================================================
pub use frame::{decode_frames, discriminator, encode, JsonObject, ProtocolError};

// =============================================================================
// Twitch PubSub
// =============================================================================
pub use pubsub::{
    format_topic, ListenData, PubSubRequest, ResponseErrorKind, PUBSUB_URL, USER_ID_PLACEHOLDER,
};

// =============================================================================
// Archipelago
// =============================================================================
pub use archipelago::{
    encode_commands, ArchipelagoCredentials, ClientCommand, ConnectRequest, CredentialsError,
    NetworkVersion, DEFAULT_TAGS, FATAL_REFUSALS, ITEMS_HANDLING_ALL, KEEPALIVE_KEY,
};
