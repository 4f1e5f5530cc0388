use crate::association_error::AssociationError;

/// Error returned by [crate::StoreForwarder] operations.
#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    #[error("Transfer requires a SOP instance UID, a SOP class UID and a transfer syntax")]
    InvalidTransfer,

    #[error("Could not open association with {peer}")]
    Connect {
        peer: String,
        #[source]
        source: AssociationError,
    },

    #[error("No association is ready for data transfer, call prepare_transfer first")]
    NoAssociation,

    #[error("Cancelled while waiting for pending transfers")]
    Cancelled,

    #[error("C-STORE of {sop_instance_uid} failed")]
    Store {
        sop_instance_uid: String,
        #[source]
        source: AssociationError,
    },
}
