// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod connection;
pub mod discovery;
pub mod externalip;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export key types for easier access.
pub use connection::{ConnectionType, PeerConnection};
pub use discovery::{Discovery, StaticDiscovery};
pub use memory::MemoryNetwork;
pub use protocol::BlockInfo;
pub use session::PeerSession;
pub use transport::{PeerAddrInfo, PeerId, TcpTransport, Transport};
