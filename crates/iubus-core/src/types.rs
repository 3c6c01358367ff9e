//! Small protocol enums and identifier helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use rand::Rng;

/// Channel used when a buffer is not configured with one.
pub const DEFAULT_CHANNEL: &str = "default";

/// How an IU participates in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Owned IU whose changes are pushed to subscribers.
    Push,
    /// Pull-style access. Carried on the wire for compatibility only.
    Remote,
    /// Fire-and-forget IU, never retained by subscribers.
    Message,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Push => "PUSH",
            AccessMode::Remote => "REMOTE",
            AccessMode::Message => "MESSAGE",
        }
    }
}

/// Encoding used for payload values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PayloadType {
    /// Values are arbitrary JSON trees.
    #[default]
    Json,
    /// Legacy mode: values are plain strings.
    Str,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Json => "JSON",
            PayloadType::Str => "STR",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kinds of event a buffer can report to its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IuEventType {
    Added = 1,
    Committed = 2,
    Deleted = 4,
    Retracted = 8,
    Updated = 16,
    LinksUpdated = 32,
    Message = 64,
}

impl IuEventType {
    /// All event types, in bit order.
    pub const ALL: [IuEventType; 7] = [
        IuEventType::Added,
        IuEventType::Committed,
        IuEventType::Deleted,
        IuEventType::Retracted,
        IuEventType::Updated,
        IuEventType::LinksUpdated,
        IuEventType::Message,
    ];

    pub const fn bit(self) -> u32 {
        self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IuEventType::Added => "ADDED",
            IuEventType::Committed => "COMMITTED",
            IuEventType::Deleted => "DELETED",
            IuEventType::Retracted => "RETRACTED",
            IuEventType::Updated => "UPDATED",
            IuEventType::LinksUpdated => "LINKSUPDATED",
            IuEventType::Message => "MESSAGE",
        }
    }
}

impl fmt::Display for IuEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`IuEventType`]s, used to filter handler invocations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(127);

    pub const fn contains(&self, event: IuEventType) -> bool {
        self.0 & event.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<IuEventType> for EventMask {
    fn from(event: IuEventType) -> Self {
        Self(event.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<IuEventType> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: IuEventType) -> Self::Output {
        Self(self.0 | rhs.bit())
    }
}

impl BitOr for IuEventType {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.bit() | rhs.bit())
    }
}

impl BitOr<EventMask> for IuEventType {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> Self::Output {
        EventMask(self.bit() | rhs.0)
    }
}

impl BitOrAssign<IuEventType> for EventMask {
    fn bitor_assign(&mut self, rhs: IuEventType) {
        self.0 |= rhs.bit();
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = IuEventType::ALL
            .iter()
            .filter(|e| self.contains(**e))
            .map(|e| e.as_str())
            .collect();
        write!(f, "EventMask({})", names.join("|"))
    }
}

/// Generate a fresh IU uid (random 128 bits, 8-4-4-4-12 hex form).
pub fn generate_uid() -> String {
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    // version 4, RFC 4122 variant
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Generate a short buffer instance id (8 hex characters).
pub fn generate_instance_id() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask_union() {
        let mask = IuEventType::Added | IuEventType::Updated;
        assert!(mask.contains(IuEventType::Added));
        assert!(mask.contains(IuEventType::Updated));
        assert!(!mask.contains(IuEventType::Retracted));
        assert_eq!(mask.0, 17);
    }

    #[test]
    fn test_event_mask_all_covers_every_type() {
        for event in IuEventType::ALL {
            assert!(EventMask::ALL.contains(event));
        }
        assert!(!EventMask::NONE.contains(IuEventType::Message));
    }

    #[test]
    fn test_event_mask_debug() {
        let mask = EventMask::from(IuEventType::Committed) | IuEventType::Message;
        assert_eq!(format!("{:?}", mask), "EventMask(COMMITTED|MESSAGE)");
    }

    #[test]
    fn test_uid_format() {
        let uid = generate_uid();
        assert_eq!(uid.len(), 36);
        let groups: Vec<_> = uid.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
        assert_eq!(&uid[14..15], "4");
        assert_ne!(uid, generate_uid());
    }

    #[test]
    fn test_instance_id_format() {
        let id = generate_instance_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
