use dicom::ul::association::client;

/// Error which might happen while talking to the peer over an association.
#[derive(thiserror::Error, Debug)]
pub enum AssociationError {
    #[error("Could not establish association.")]
    CouldNotEstablish(#[source] client::Error),

    #[error("Timed out after {0:?} while establishing association.")]
    Timeout(std::time::Duration),

    #[error("No presentation context to propose")]
    NothingToPropose,

    #[error("Association is not ready for data transfer")]
    NotReady,

    #[error("No presentation context was accepted for {abstract_syntax} in {transfer_syntax}")]
    NoPresentationContext {
        abstract_syntax: String,
        transfer_syntax: String,
    },

    #[error("Could not write DIMSE command")]
    CreateCommand(#[from] dicom::object::WriteError),

    #[error("Could not write data set")]
    DataSource(#[from] crate::data_source::DataSourceError),

    #[error("{0}")]
    CannotSend(&'static str, #[source] client::Error),

    #[error("Failed to stream data set to peer")]
    CannotStream(#[from] std::io::Error),

    #[error("Failed to receive response from peer")]
    CannotReceive(#[source] client::Error),

    #[error("Could not read response from peer")]
    FailedToReadResponse(#[from] dicom::object::ReadError),

    #[error("Response from peer has no status")]
    MissingStatus,

    #[error("Unexpected PDU from peer: {0}")]
    UnexpectedPdu(String),

    #[error("Association was aborted")]
    Aborted,

    #[error("Association was closed while waiting for a response")]
    Closed,

    #[error("Timed out after {0:?} while closing association.")]
    CloseTimeout(std::time::Duration),

    #[error("Failed to release association")]
    Release(#[source] client::Error),

    #[error("Failed to abort association")]
    Abort(#[source] client::Error),
}
