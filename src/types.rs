use aliri_braid::braid;

/// Our AE title, used as the calling AE title of outbound associations.
#[braid(serde)]
pub struct CallingAETitle;

/// The AE title of the peer we forward DICOM objects to.
#[braid(serde)]
pub struct CalledAETitle;

/// Remove the trailing padding (`'\0'` or spaces) DICOM puts on odd-length UI values.
pub(crate) fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
}
