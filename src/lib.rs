mod association;
mod association_error;
mod config;
mod data_source;
mod dicomrs_association;
mod error;
mod forwarder;
mod idle_close;
mod inflight;
mod negotiator;
mod presentation_context;
mod progress;
mod settings;
mod types;

pub use association::{
    Association, Connector, Priority, ResponseHandler, StoreRequest, StoreResponse,
};
pub use association_error::AssociationError;
pub use config::get_config;
pub use data_source::{BytesSource, DataSource, DataSourceError, DicomObjectSource};
pub use dicomrs_association::{DicomUlAssociation, DicomUlConnector};
pub use error::ForwardError;
pub use forwarder::StoreForwarder;
pub use idle_close::IdleCloseScheduler;
pub use inflight::{Drained, InFlightGuard, InFlightTracker, WaitCancelled};
pub use negotiator::{select_from, select_transfer_syntax};
pub use presentation_context::{PresentationContextSet, ProposedContext};
pub use progress::{Progress, ProgressState, StatusKind};
pub use settings::{Endpoint, ForwardOptions, ForwarderSettings, MAX_WAIT_LOOPS, WAIT_SLEEP_MS};
pub use types::{CalledAETitle, CallingAETitle};
