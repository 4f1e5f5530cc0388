use crate::association::Association;
use crate::types::trim_uid;
use dicom::dictionary_std::uids;
use std::collections::HashSet;

/// Choose the transfer syntax to send an object of class `abstract_syntax` with.
///
/// `preferred` is used if the peer accepted it, otherwise explicit VR little endian,
/// otherwise implicit VR little endian. When nothing was accepted, implicit VR little
/// endian is returned since every peer must support it. Compressed syntaxes are never
/// substituted.
pub fn select_transfer_syntax<A: Association + ?Sized>(
    association: &A,
    abstract_syntax: &str,
    preferred: &str,
) -> String {
    select_from(
        &association.transfer_syntaxes_for(trim_uid(abstract_syntax)),
        preferred,
    )
}

/// [select_transfer_syntax] given the accepted transfer syntaxes.
pub fn select_from(accepted: &HashSet<String>, preferred: &str) -> String {
    let preferred = trim_uid(preferred);
    [
        preferred,
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
    ]
    .into_iter()
    .find(|ts| accepted.contains(*ts))
    .unwrap_or(uids::IMPLICIT_VR_LITTLE_ENDIAN)
    .to_string()
}
