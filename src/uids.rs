//! Well-known UIDs and AE-title helpers.
//!
//! Only the identifiers the engine itself needs are listed here; service
//! implementations bring their own SOP class tables.

/// The DICOM application context name, the only one the standard defines.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implicit VR little endian, the default transfer syntax.
///
/// The DIMSE command stream is always encoded with this syntax regardless
/// of what the presentation context negotiated for datasets.
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

/// Explicit VR little endian.
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// Explicit VR big endian (retired, still seen on the wire).
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Verification SOP class (C-ECHO).
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Implementation class UID advertised in user information.
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.2.1396.999";

/// Implementation version name advertised in user information.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSERVE01";

/// Upper layer protocol version; bit 0 set per PS 3.8 §9.3.2.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Wire length of an AE title field.
pub const AE_TITLE_LEN: usize = 16;

/// Pad an AE title to its fixed 16-byte wire form.
///
/// Oversized titles are truncated; the standard caps them at 16 characters.
#[must_use]
pub fn pad_ae_title(title: &str) -> [u8; AE_TITLE_LEN] {
    let mut out = [b' '; AE_TITLE_LEN];
    for (dst, src) in out.iter_mut().zip(title.bytes()) {
        *dst = src;
    }
    out
}

/// Recover an AE title from its wire form, dropping the space padding.
#[must_use]
pub fn trim_ae_title(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// Whether a transfer syntax encodes explicit value representations.
///
/// Every registered transfer syntax other than implicit VR little endian is
/// explicit VR.
#[must_use]
pub fn is_explicit_vr(transfer_syntax: &str) -> bool {
    transfer_syntax != IMPLICIT_VR_LITTLE_ENDIAN
}

/// Whether a transfer syntax encodes multibyte values big-endian.
#[must_use]
pub fn is_big_endian(transfer_syntax: &str) -> bool {
    transfer_syntax == EXPLICIT_VR_BIG_ENDIAN
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("STORESCP", b"STORESCP        ")]
    #[case("", b"                ")]
    #[case("EXACTLY16CHARSAB", b"EXACTLY16CHARSAB")]
    #[case("WAY_TOO_LONG_AE_TITLE", b"WAY_TOO_LONG_AE_")]
    fn ae_titles_pad_to_sixteen_bytes(#[case] title: &str, #[case] wire: &[u8; 16]) {
        assert_eq!(&pad_ae_title(title), wire);
    }

    #[rstest]
    #[case(b"STORESCP        ", "STORESCP")]
    #[case(b"  PADDED_BOTH   ", "PADDED_BOTH")]
    #[case(b"                ", "")]
    fn ae_titles_trim_wire_padding(#[case] wire: &[u8; 16], #[case] title: &str) {
        assert_eq!(trim_ae_title(wire), title);
    }
}
