// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The key pair that authorizes services to co-locate on one address.

use serde::{Deserialize, Serialize};

/// The sharing descriptor attached to every assignment.
///
/// Services may co-reside on an IP address only while they all present the
/// same non-empty `sharing` component and the same `backend` component.  An
/// empty `sharing` component opts the service out of co-location entirely.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SharingKey {
    pub sharing: String,
    pub backend: String,
}

impl SharingKey {
    pub fn new(sharing: &str, backend: &str) -> SharingKey {
        SharingKey {
            sharing: sharing.to_string(),
            backend: backend.to_string(),
        }
    }

    /// Report whether a service presenting `other` may join an address whose
    /// current holders agreed on `self`.
    pub fn compatible_with(&self, other: &SharingKey) -> bool {
        !self.sharing.is_empty()
            && !other.sharing.is_empty()
            && self == other
    }

    /// Report whether this key permits co-location at all.
    pub fn enables_sharing(&self) -> bool {
        !self.sharing.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compatibility() {
        let a = SharingKey::new("share", "backend");
        assert!(a.compatible_with(&SharingKey::new("share", "backend")));
        assert!(!a.compatible_with(&SharingKey::new("other", "backend")));
        assert!(!a.compatible_with(&SharingKey::new("share", "other")));
        assert!(!a.compatible_with(&SharingKey::new("", "backend")));
        // An empty sharing component never matches anything, itself
        // included.
        let unshared = SharingKey::new("", "");
        assert!(!unshared.compatible_with(&unshared));
        assert!(!unshared.enables_sharing());
        assert!(a.enables_sharing());
    }
}
