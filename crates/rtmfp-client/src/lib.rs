// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A blocking, ABI-friendly RTMFP client library: connect to a server,
//! request p2p introductions, join NetGroup meshes, and move FLV-framed
//! media and `callFunction` invocations across all three — built on top of
//! [`rtmfp_core`]'s async session engine the way a thin native-plugin shim
//! sits on top of a runtime it doesn't want to expose to its callers.

mod amf;
mod client;
mod config;
mod error;
mod flv;
mod group_media_config;
mod media;

pub use amf::{AmfEncode, Amf0Encoder, Value};
pub use client::{CallTarget, ConnectionId, MediaId, RtmfpClient};
pub use config::{Config, ConfigError, ConfigService, ConfigStore, FsConfigStore, GroupConfig};
pub use error::{ClientError, Result};
pub use media::{MediaSink, MediaStream};

pub use rtmfp_proto::PeerId;
