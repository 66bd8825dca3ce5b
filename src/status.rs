//! # Signature verification outcome.

use num_derive::{FromPrimitive, ToPrimitive};
use strum_macros::{Display, EnumIter};

/// Result of checking the signature of one protected payload.
///
/// The integer values are stable and can be handed to consumers that only
/// understand numeric codes, see [num_traits::ToPrimitive].
#[derive(
    Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, EnumIter,
)]
#[repr(i32)]
pub enum VerificationStatus {
    /// Signature verified with one of the supplied public keys.
    Valid = 0,

    /// The payload carries no signature.
    #[default]
    NotSigned = 1,

    /// The payload is signed but no public key was supplied to check it.
    NoVerifier = 2,

    /// The signature could not be checked at all, e.g. it is not parseable.
    Failed = 3,

    /// The signature does not match the content or the supplied keys,
    /// or it claims a creation time after the reference time.
    Invalid = 4,
}

impl VerificationStatus {
    pub fn is_valid(self) -> bool {
        self == VerificationStatus::Valid
    }

    /// Merges the results of two nested protection layers.
    ///
    /// `NotSigned` is neutral. Otherwise any non-valid result wins over `Valid`,
    /// and between two failures the inner one is kept.
    pub fn combine(self, inner: VerificationStatus) -> VerificationStatus {
        use VerificationStatus::*;
        match (self, inner) {
            (NotSigned, other) | (other, NotSigned) => other,
            (Valid, other) => other,
            (outer, Valid) => outer,
            (_, inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use num_traits::{FromPrimitive, ToPrimitive};
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in VerificationStatus::iter() {
            let code = status.to_i32().unwrap();
            assert_eq!(VerificationStatus::from_i32(code), Some(status));
        }
        assert_eq!(VerificationStatus::Valid.to_i32(), Some(0));
        assert_eq!(VerificationStatus::NotSigned.to_i32(), Some(1));
        assert_eq!(VerificationStatus::from_i32(42), None);
    }

    #[test]
    fn test_combine() {
        use VerificationStatus::*;
        assert_eq!(NotSigned.combine(Valid), Valid);
        assert_eq!(Valid.combine(NotSigned), Valid);
        assert_eq!(NotSigned.combine(NotSigned), NotSigned);
        assert_eq!(Valid.combine(Valid), Valid);
        assert_eq!(Valid.combine(Invalid), Invalid);
        assert_eq!(NoVerifier.combine(Valid), NoVerifier);
        assert_eq!(Failed.combine(Invalid), Invalid);
    }
}
