//! Event kinds and their storage classes.
//!
//! A kind is an unsigned 16-bit class selector. Its numeric range decides how
//! the relay stores it:
//!
//! | Range            | Class                      |
//! |------------------|----------------------------|
//! | 0, 3             | replaceable                |
//! | 10000..=19999    | replaceable                |
//! | 20000..=29999    | ephemeral (never stored)   |
//! | 30000..=39999    | parameterized-replaceable  |
//! | everything else  | regular                    |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event class selector.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

/// Profile metadata.
pub const PROFILE_METADATA: Kind = Kind(0);
/// Short text note.
pub const TEXT_NOTE: Kind = Kind(1);
/// Follow list (contact list).
pub const FOLLOW_LIST: Kind = Kind(3);
/// Encrypted direct message.
pub const ENCRYPTED_DIRECT_MESSAGE: Kind = Kind(4);
/// Deletion request.
pub const DELETION: Kind = Kind(5);
/// Sealed direct message.
pub const SEAL: Kind = Kind(13);
/// Private direct message.
pub const PRIVATE_DIRECT_MESSAGE: Kind = Kind(14);
/// Gift wrap.
pub const GIFT_WRAP: Kind = Kind(1059);
/// Gift wrap carrying a kind-4 payload.
pub const GIFT_WRAP_WITH_KIND_4: Kind = Kind(1060);
/// Report.
pub const REPORTING: Kind = Kind(1984);
/// Mute list.
pub const MUTE_LIST: Kind = Kind(10000);
/// Relay list metadata.
pub const RELAY_LIST_METADATA: Kind = Kind(10002);
/// Direct-message relay list.
pub const DM_RELAY_LIST: Kind = Kind(10050);
/// Client authentication (challenge response).
pub const CLIENT_AUTHENTICATION: Kind = Kind(22242);

/// Globally-readable profile/discovery kinds served to unauthenticated readers.
pub const DIRECTORY: &[Kind] = &[
    PROFILE_METADATA,
    FOLLOW_LIST,
    DELETION,
    REPORTING,
    MUTE_LIST,
    RELAY_LIST_METADATA,
    DM_RELAY_LIST,
];

/// Kinds addressed to a restricted audience.
pub const PRIVILEGED: &[Kind] = &[
    ENCRYPTED_DIRECT_MESSAGE,
    SEAL,
    PRIVATE_DIRECT_MESSAGE,
    GIFT_WRAP,
    GIFT_WRAP_WITH_KIND_4,
];

impl Kind {
    /// Raw numeric value.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Newer events supersede older ones sharing author+kind.
    pub fn is_replaceable(self) -> bool {
        self.0 == 0 || self.0 == 3 || (10000..20000).contains(&self.0)
    }

    /// Never persisted, only fanned out.
    pub fn is_ephemeral(self) -> bool {
        (20000..30000).contains(&self.0)
    }

    /// Newer events supersede older ones sharing author+kind+`d` tag.
    pub fn is_parameterized_replaceable(self) -> bool {
        (30000..40000).contains(&self.0)
    }

    /// Always stored, never superseded.
    pub fn is_regular(self) -> bool {
        !self.is_replaceable() && !self.is_ephemeral() && !self.is_parameterized_replaceable()
    }

    /// Deletion requests.
    pub fn is_deletion(self) -> bool {
        self == DELETION
    }

    /// Follow or mute list, the inputs to access-list derivation.
    pub fn is_access_list(self) -> bool {
        self == FOLLOW_LIST || self == MUTE_LIST
    }

    /// Globally-readable directory kind.
    pub fn is_directory(self) -> bool {
        DIRECTORY.contains(&self)
    }

    /// Kind meant for directed private messages.
    pub fn is_privileged(self) -> bool {
        PRIVILEGED.contains(&self)
    }
}

impl From<u16> for Kind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_disjoint() {
        for raw in [0u16, 1, 3, 4, 5, 9999, 10000, 19999, 20000, 29999, 30000, 39999, 40000, 65535] {
            let kind = Kind(raw);
            let classes = [
                kind.is_regular(),
                kind.is_replaceable(),
                kind.is_ephemeral(),
                kind.is_parameterized_replaceable(),
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "kind {raw}");
        }
    }

    #[test]
    fn replaceable_ranges() {
        assert!(PROFILE_METADATA.is_replaceable());
        assert!(FOLLOW_LIST.is_replaceable());
        assert!(MUTE_LIST.is_replaceable());
        assert!(!TEXT_NOTE.is_replaceable());
        assert!(Kind(30023).is_parameterized_replaceable());
        assert!(Kind(25000).is_ephemeral());
        assert!(CLIENT_AUTHENTICATION.is_ephemeral());
    }

    #[test]
    fn directory_and_privileged_do_not_overlap() {
        for kind in DIRECTORY {
            assert!(!kind.is_privileged());
        }
        assert!(ENCRYPTED_DIRECT_MESSAGE.is_privileged());
        assert!(GIFT_WRAP.is_privileged());
        assert!(FOLLOW_LIST.is_access_list());
        assert!(!TEXT_NOTE.is_access_list());
    }
}
