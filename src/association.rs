//! The association capability consumed by [crate::StoreForwarder].
//!
//! [crate::DicomUlConnector] implements it over `dicom-ul`. Tests can substitute
//! their own [Connector] to observe every interaction with the peer.

use crate::association_error::AssociationError;
use crate::data_source::DataSource;
use crate::presentation_context::PresentationContextSet;
use crate::settings::{Endpoint, ForwardOptions};
use async_trait::async_trait;
use std::collections::HashSet;

/// Opens associations.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Association: Association;

    /// Open a new association with `endpoint`, proposing every pair in `contexts`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ForwardOptions,
        contexts: &PresentationContextSet,
    ) -> Result<Self::Association, AssociationError>;
}

/// One live association.
#[async_trait]
pub trait Association: Send + Sync + 'static {
    fn is_ready_for_data_transfer(&self) -> bool;

    /// Transfer syntaxes the peer accepted for `abstract_syntax`. Empty if none were.
    fn transfer_syntaxes_for(&self, abstract_syntax: &str) -> HashSet<String>;

    /// Send a C-STORE-RQ. Every response is passed to `handler`.
    ///
    /// Returns the message ID the request was sent with.
    async fn store(
        &self,
        request: StoreRequest,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<u16, AssociationError>;

    /// Request a graceful release (A-RELEASE).
    async fn release(&self) -> Result<(), AssociationError>;

    /// Wait until the underlying connection is closed.
    async fn wait_for_socket_close(&self) -> Result<(), AssociationError>;

    /// Abort the association (A-ABORT).
    async fn abort(&self) -> Result<(), AssociationError>;
}

/// Receives the responses to one C-STORE-RQ.
pub trait ResponseHandler: Send + 'static {
    fn on_response(&mut self, response: &StoreResponse);
}

/// A C-STORE-RQ about to be sent.
pub struct StoreRequest {
    pub abstract_syntax: String,
    pub sop_instance_uid: String,
    pub priority: Priority,
    pub transfer_syntax: String,
    pub data: Box<dyn DataSource>,
}

/// A C-STORE-RSP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub message_id: u16,
    pub status: u16,
    pub affected_sop_instance_uid: String,
    pub affected_sop_class_uid: String,
}

impl StoreResponse {
    /// Whether more responses will follow.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, 0xFF00 | 0xFF01)
    }
}

/// DIMSE request priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// The value of the (0000,0700) Priority command element.
    pub fn value(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }
}
