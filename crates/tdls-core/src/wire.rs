//! Management-action header — the structured prefix of every TDLS action frame.
//!
//! The control plane only interprets this header; frame bodies (information
//! elements, capabilities, link identifiers) are opaque byte payloads that
//! the transport collaborator encodes and decodes.
//!
//! The header is #[repr(C, packed)] with zerocopy derives so it can be
//! prepended to an outbound body or split off an inbound one without
//! copying. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Action codes ─────────────────────────────────────────────────────────────

/// TDLS action field values (IEEE 802.11, Table 9-357).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionCode {
    SetupRequest = 0,
    SetupResponse = 1,
    SetupConfirm = 2,
    Teardown = 3,
    PeerTrafficIndication = 4,
    ChannelSwitchRequest = 5,
    ChannelSwitchResponse = 6,
    PeerTrafficResponse = 9,
    DiscoveryRequest = 10,
    /// Travels as a broadcast public action frame rather than over the
    /// direct path, but is correlated here like the rest.
    DiscoveryResponse = 14,
}

impl TryFrom<u8> for ActionCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ActionCode::SetupRequest,
            1 => ActionCode::SetupResponse,
            2 => ActionCode::SetupConfirm,
            3 => ActionCode::Teardown,
            4 => ActionCode::PeerTrafficIndication,
            5 => ActionCode::ChannelSwitchRequest,
            6 => ActionCode::ChannelSwitchResponse,
            9 => ActionCode::PeerTrafficResponse,
            10 => ActionCode::DiscoveryRequest,
            14 => ActionCode::DiscoveryResponse,
            other => return Err(other),
        })
    }
}

// ── Status codes ─────────────────────────────────────────────────────────────

/// 802.11 status codes carried by setup responses and teardowns.
pub mod status_code {
    pub const SUCCESS: u16 = 0;
    pub const UNSPECIFIED_FAILURE: u16 = 1;
    pub const PEER_UNREACHABLE: u16 = 25;
    pub const UNSPECIFIED_REASON: u16 = 26;
    pub const REQUEST_DECLINED: u16 = 37;
}

/// Responder bit in [`ActionHeader::flags`].
pub const FLAG_RESPONDER: u8 = 0x01;

// ── Header ───────────────────────────────────────────────────────────────────

/// Structured prefix of every inbound and outbound TDLS action frame.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ActionHeader {
    /// Correlates a response to its request. Zero is never assigned.
    pub dialog_token: u8,

    /// Action field value ([`ActionCode`] as u8). Unknown values are
    /// dropped by the receiver with a warning.
    pub action: u8,

    /// 802.11 status code. Zero on requests.
    pub status: u16,

    /// Bit 0: the sender is the responder of this exchange. Other bits
    /// reserved, must be zero.
    pub flags: u8,

    pub reserved: u8,
}

// Compile-time size guard.
assert_eq_size!(ActionHeader, [u8; 6]);

impl ActionHeader {
    pub fn request(dialog_token: u8, action: ActionCode) -> Self {
        Self {
            dialog_token,
            action: action as u8,
            status: status_code::SUCCESS,
            flags: 0,
            reserved: 0,
        }
    }

    pub fn response(dialog_token: u8, action: ActionCode, status: u16, responder: bool) -> Self {
        Self {
            dialog_token,
            action: action as u8,
            status,
            flags: if responder { FLAG_RESPONDER } else { 0 },
            reserved: 0,
        }
    }

    /// The decoded action field, or `None` for values this plane does not
    /// understand.
    pub fn action_code(&self) -> Option<ActionCode> {
        ActionCode::try_from(self.action).ok()
    }

    pub fn is_responder(&self) -> bool {
        self.flags & FLAG_RESPONDER != 0
    }
}
