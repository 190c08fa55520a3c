//! McApp gateway: a MeshCom LoRa mesh gateway daemon.
//!
//! Multiplexes a single physical radio into a concurrent multi-client chat,
//! telemetry and command service over IP. Every inbound packet — UDP
//! MeshCom frame or BLE notification — is decoded into a canonical record,
//! published on the in-process [`router`], persisted by the [`storage`]
//! engine, fanned out to SSE clients and inspected by the [`commands`]
//! engine. Outbound traffic flows the other way, with the suppression
//! oracle diverting self-targeted commands to local execution instead of
//! the wire.

pub mod ble;
pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod message;
pub mod router;
pub mod sse;
pub mod storage;
pub mod udp;
pub mod update;
pub mod weather;
pub mod wire;

pub use crate::config::GatewayConfig;
pub use crate::error::{GatewayError, GatewayResult};
pub use crate::message::{MeshMessage, MessageKind, OutboundMessage};
pub use crate::router::{MessageRouter, RouterEvent, Topic};
pub use crate::storage::StorageEngine;
