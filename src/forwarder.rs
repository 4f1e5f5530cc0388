//! Forward a stream of DICOM objects to a peer over a single, lazily opened association.

use crate::association::{
    Association, Connector, Priority, ResponseHandler, StoreRequest, StoreResponse,
};
use crate::association_error::AssociationError;
use crate::data_source::DataSource;
use crate::error::ForwardError;
use crate::idle_close::IdleCloseScheduler;
use crate::inflight::{Drained, InFlightGuard, InFlightTracker};
use crate::negotiator::select_transfer_syntax;
use crate::presentation_context::PresentationContextSet;
use crate::progress::ProgressState;
use crate::settings::{Endpoint, ForwardOptions};
use crate::types::trim_uid;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Multiplexes C-STORE requests from any number of tasks onto one association.
///
/// The association is opened by [StoreForwarder::prepare_transfer] when there is
/// something to send, reused while the objects' encodings are supported, and
/// renegotiated when an object needs a transfer syntax it was not proposed with.
/// Cloning gives another handle to the same forwarder.
pub struct StoreForwarder<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for StoreForwarder<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Connector> {
    connector: C,
    endpoint: Endpoint,
    options: ForwardOptions,
    contexts: Mutex<PresentationContextSet>,
    association: Mutex<Option<Arc<Live<C::Association>>>>,
    /// Held while opening, closing or renegotiating.
    transition: tokio::sync::Mutex<()>,
    in_flight: Arc<InFlightTracker>,
    idle_close: IdleCloseScheduler,
    /// Incremented by every prepare_transfer and cstore.
    activity: AtomicU64,
    progress: Arc<ProgressState>,
    shutdown: CancellationToken,
}

/// An open association and what it was proposed with.
struct Live<A> {
    association: A,
    proposed: PresentationContextSet,
    ulid: Ulid,
}

impl<C: Connector> StoreForwarder<C> {
    pub fn new(connector: C, endpoint: Endpoint, options: ForwardOptions) -> Self {
        Self::with_progress(connector, endpoint, options, Arc::new(ProgressState::new()))
    }

    /// Create a forwarder reporting responses to the given `progress`.
    pub fn with_progress(
        connector: C,
        endpoint: Endpoint,
        options: ForwardOptions,
        progress: Arc<ProgressState>,
    ) -> Self {
        let inner = Inner {
            connector,
            endpoint,
            options,
            contexts: Default::default(),
            association: Default::default(),
            transition: Default::default(),
            in_flight: Default::default(),
            idle_close: IdleCloseScheduler::new(),
            activity: AtomicU64::new(0),
            progress,
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Offer `transfer_syntax` for `abstract_syntax` in the next association opened.
    ///
    /// See [PresentationContextSet::add_data].
    pub fn add_data(&self, abstract_syntax: &str, transfer_syntax: &str) -> bool {
        self.inner.lock_contexts().add_data_with_relationship(
            abstract_syntax,
            transfer_syntax,
            self.inner.options.relationship_negotiation,
        )
    }

    /// Make sure an association able to carry `transfer_syntax` for `abstract_syntax`
    /// is open.
    ///
    /// - Without association, one is opened.
    /// - If the open association accepted the transfer syntax, or it was already
    ///   proposed and the peer chose another one for the abstract syntax, nothing happens.
    /// - Otherwise, waits for the transfers in flight, closes the association and opens
    ///   a new one proposing the new pair.
    ///
    /// The wait is bounded by [ForwardOptions::max_wait_loops]: once reached, the
    /// association is closed even though transfers are still in flight, which makes
    /// those transfers fail. If `cancel` fires during the wait, [ForwardError::Cancelled]
    /// is returned and the association is left as it was.
    pub async fn prepare_transfer(
        &self,
        sop_instance_uid: &str,
        abstract_syntax: &str,
        transfer_syntax: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ForwardError> {
        self.prepare(sop_instance_uid, abstract_syntax, transfer_syntax, cancel)
            .await
            .map(drop)
    }

    /// [StoreForwarder::prepare_transfer], marking `sop_instance_uid` in flight before
    /// the transition lock is released.
    async fn prepare(
        &self,
        sop_instance_uid: &str,
        abstract_syntax: &str,
        transfer_syntax: &str,
        cancel: &CancellationToken,
    ) -> Result<InFlightGuard, ForwardError> {
        let inner = &self.inner;
        if trim_uid(sop_instance_uid).is_empty() || !self.add_data(abstract_syntax, transfer_syntax)
        {
            return Err(ForwardError::InvalidTransfer);
        }
        let sop_instance_uid = trim_uid(sop_instance_uid);
        let abstract_syntax = trim_uid(abstract_syntax);
        let transfer_syntax = trim_uid(transfer_syntax);
        let _transition = inner.transition.lock().await;
        inner.touch();

        let Some(live) = inner.current() else {
            inner.open().await?;
            return Ok(inner.in_flight.guard(sop_instance_uid));
        };
        let ready = live.association.is_ready_for_data_transfer();
        if ready && live.is_compatible(abstract_syntax, transfer_syntax) {
            return Ok(inner.in_flight.guard(sop_instance_uid));
        }
        tracing::info!(
            association_ulid = live.ulid.to_string(),
            ready,
            SOPClassUID = abstract_syntax,
            TransferSyntaxUID = transfer_syntax,
            "renegotiating association"
        );
        inner.idle_close.reset();
        match inner.wait_for_pending(cancel).await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    association_ulid = live.ulid.to_string(),
                    SOPInstanceUID = sop_instance_uid,
                    "cancelled while waiting for pending transfers"
                );
                return Err(e);
            }
        }
        drop(live);
        inner.close_now().await;
        inner.open().await?;
        Ok(inner.in_flight.guard(sop_instance_uid))
    }

    /// Send a C-STORE-RQ over the current association.
    ///
    /// Fails with [ForwardError::NoAssociation] if [StoreForwarder::prepare_transfer]
    /// did not open one. `sop_instance_uid` is in flight until the final response.
    /// Returns the message ID of the request.
    pub async fn cstore(
        &self,
        abstract_syntax: &str,
        sop_instance_uid: &str,
        priority: Priority,
        data: Box<dyn DataSource>,
        transfer_syntax: &str,
    ) -> Result<u16, ForwardError> {
        let request = StoreRequest {
            abstract_syntax: trim_uid(abstract_syntax).to_string(),
            sop_instance_uid: trim_uid(sop_instance_uid).to_string(),
            priority,
            transfer_syntax: trim_uid(transfer_syntax).to_string(),
            data,
        };
        let guard = self.inner.in_flight.guard(&request.sop_instance_uid);
        self.dispatch(request, guard, None).await
    }

    /// Prepare the association for `data`, store it, and re-arm the idle close.
    ///
    /// `data` is in flight from the moment the association is prepared, so a
    /// renegotiation by another task waits for it. Returns the final response of the peer.
    pub async fn send(
        &self,
        data: Box<dyn DataSource>,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<StoreResponse, ForwardError> {
        let abstract_syntax = trim_uid(data.sop_class_uid()).to_string();
        let sop_instance_uid = trim_uid(data.sop_instance_uid()).to_string();
        let native = trim_uid(data.transfer_syntax()).to_string();
        let guard = self
            .prepare(&sop_instance_uid, &abstract_syntax, &native, cancel)
            .await?;
        let live = self.inner.current().ok_or(ForwardError::NoAssociation)?;
        let transfer_syntax = select_transfer_syntax(&live.association, &abstract_syntax, &native);
        drop(live);
        if transfer_syntax != native {
            tracing::debug!(
                SOPInstanceUID = &sop_instance_uid,
                from = &native,
                to = &transfer_syntax,
                "peer did not accept native transfer syntax"
            );
        }
        let request = StoreRequest {
            abstract_syntax,
            sop_instance_uid: sop_instance_uid.clone(),
            priority,
            transfer_syntax,
            data,
        };
        let (tx, rx) = oneshot::channel();
        let result = self.dispatch(request, guard, Some(tx)).await;
        self.trigger_close_executor();
        result?;
        rx.await.map_err(|_| ForwardError::Store {
            sop_instance_uid,
            source: AssociationError::MissingStatus,
        })
    }

    /// Release the association after [ForwardOptions::idle_timeout] unless something
    /// is sent in the meantime. Calling again restarts the countdown.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger_close_executor(&self) {
        let armed_at = self.inner.activity.load(Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .idle_close
            .arm(self.inner.options.idle_timeout, close_if_idle(weak, armed_at));
    }

    /// Close the association, if any.
    ///
    /// With `wait_for_pending`, first waits (bounded) for the transfers in flight.
    /// Release errors are logged. Afterwards there is no association.
    pub async fn close(&self, wait_for_pending: bool) {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        if inner.current().is_none() {
            return;
        }
        if wait_for_pending && inner.wait_for_pending(&inner.shutdown).await.is_err() {
            tracing::debug!("shutting down, not waiting for pending transfers");
        }
        inner.close_now().await;
    }

    /// Cancel waits, disarm the idle close and close the association.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.idle_close.cancel();
        self.close(false).await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current().is_some()
    }

    pub fn is_ready_for_data_transfer(&self) -> bool {
        self.inner
            .current()
            .is_some_and(|live| live.association.is_ready_for_data_transfer())
    }

    /// Snapshot of what the next association will be proposed with.
    pub fn presentation_contexts(&self) -> PresentationContextSet {
        self.inner.lock_contexts().clone()
    }

    pub fn progress(&self) -> &Arc<ProgressState> {
        &self.inner.progress
    }

    pub fn in_flight(&self) -> &Arc<InFlightTracker> {
        &self.inner.in_flight
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.inner.options
    }

    /// Store `request` over the current association, reporting into the progress.
    ///
    /// `guard` keeps the object in flight until the final response. If the progress is
    /// cancelled before then, the store is dropped and the association aborted.
    async fn dispatch(
        &self,
        request: StoreRequest,
        guard: InFlightGuard,
        final_response: Option<oneshot::Sender<StoreResponse>>,
    ) -> Result<u16, ForwardError> {
        let inner = &self.inner;
        inner.touch();
        inner.idle_close.reset();
        let live = inner
            .current()
            .filter(|live| live.association.is_ready_for_data_transfer())
            .ok_or(ForwardError::NoAssociation)?;
        let sop_instance_uid = request.sop_instance_uid.clone();
        let handler = ForwardingHandler {
            progress: Arc::clone(&inner.progress),
            guard,
            final_response,
            answered: false,
        };
        tracing::debug!(
            association_ulid = live.ulid.to_string(),
            SOPInstanceUID = &sop_instance_uid,
            TransferSyntaxUID = &request.transfer_syntax,
            "C-STORE-RQ"
        );
        let result = tokio::select! {
            biased;
            _ = inner.progress.cancelled() => Err(AssociationError::Aborted),
            result = live.association.store(request, Box::new(handler)) => result,
        };
        if inner.progress.is_cancelled() {
            inner.abort(&live).await;
        }
        result.map_err(|source| {
            tracing::error!(
                association_ulid = live.ulid.to_string(),
                SOPInstanceUID = &sop_instance_uid,
                message = source.to_string()
            );
            ForwardError::Store {
                sop_instance_uid,
                source,
            }
        })
    }
}

impl<C: Connector> Inner<C> {
    fn current(&self) -> Option<Arc<Live<C::Association>>> {
        self.lock_association().clone()
    }

    fn touch(&self) {
        self.activity.fetch_add(1, Ordering::SeqCst);
    }

    /// Open a new association with the current presentation contexts.
    ///
    /// Caller must hold the transition lock.
    async fn open(&self) -> Result<(), ForwardError> {
        let proposed = self.lock_contexts().clone();
        let ulid = Ulid::new();
        tracing::info!(
            association_ulid = ulid.to_string(),
            aet = self.endpoint.aet.as_str(),
            aec = self.endpoint.aec.as_str(),
            address = self.endpoint.address(),
            presentation_contexts = proposed.len(),
            "opening association"
        );
        let association = self
            .connector
            .connect(&self.endpoint, &self.options, &proposed)
            .await
            .map_err(|source| self.connect_error(ulid, source))?;
        if !association.is_ready_for_data_transfer() {
            if let Err(e) = association.wait_for_socket_close().await {
                tracing::warn!(
                    association_ulid = ulid.to_string(),
                    message = e.to_string(),
                    "failed waiting for connection to close"
                );
            }
            return Err(self.connect_error(ulid, AssociationError::NotReady));
        }
        let live = Live {
            association,
            proposed,
            ulid,
        };
        *self.lock_association() = Some(Arc::new(live));
        Ok(())
    }

    fn connect_error(&self, ulid: Ulid, source: AssociationError) -> ForwardError {
        tracing::error!(
            association_ulid = ulid.to_string(),
            address = self.endpoint.address(),
            message = source.to_string()
        );
        ForwardError::Connect {
            peer: self.endpoint.to_string(),
            source,
        }
    }

    async fn wait_for_pending(&self, cancel: &CancellationToken) -> Result<(), ForwardError> {
        let drained = self
            .in_flight
            .wait_until_idle(self.options.wait_sleep, self.options.max_wait_loops, cancel)
            .await
            .map_err(|_| ForwardError::Cancelled)?;
        if drained == Drained::GaveUp {
            tracing::warn!(
                max_wait_loops = self.options.max_wait_loops,
                "transfers still in flight, closing association anyway"
            );
        }
        Ok(())
    }

    /// Take the association out and close it. Errors are logged.
    ///
    /// Caller must hold the transition lock.
    async fn close_now(&self) {
        let Some(live) = self.lock_association().take() else {
            return;
        };
        let association_ulid = live.ulid.to_string();
        if live.association.is_ready_for_data_transfer() {
            if let Err(e) = live.association.release().await {
                tracing::warn!(
                    association_ulid,
                    message = e.to_string(),
                    "failed to release association"
                );
            }
        }
        if let Err(e) = live.association.wait_for_socket_close().await {
            tracing::warn!(
                association_ulid,
                message = e.to_string(),
                "failed waiting for connection to close"
            );
        }
        tracing::info!(association_ulid, "closed association");
    }

    /// Abort `live`, removing it first if it is still the current association.
    async fn abort(&self, live: &Arc<Live<C::Association>>) {
        {
            let mut current = self.lock_association();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, live)) {
                current.take();
            }
        }
        tracing::warn!(
            association_ulid = live.ulid.to_string(),
            "transfer cancelled, aborting association"
        );
        if let Err(e) = live.association.abort().await {
            tracing::warn!(
                association_ulid = live.ulid.to_string(),
                message = e.to_string(),
                "failed to abort association"
            );
        }
    }

    fn lock_association(&self) -> MutexGuard<'_, Option<Arc<Live<C::Association>>>> {
        self.association.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_contexts(&self) -> MutexGuard<'_, PresentationContextSet> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<A: Association> Live<A> {
    /// Whether an object of `abstract_syntax` in `transfer_syntax` can be sent as is, or
    /// in the transfer syntax the peer chose instead when it was proposed.
    fn is_compatible(&self, abstract_syntax: &str, transfer_syntax: &str) -> bool {
        let accepted = self.association.transfer_syntaxes_for(abstract_syntax);
        accepted.contains(transfer_syntax)
            || (!accepted.is_empty() && self.proposed.contains(abstract_syntax, transfer_syntax))
    }
}

/// Action of the idle close timer.
async fn close_if_idle<C: Connector>(inner: Weak<Inner<C>>, armed_at: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let forwarder = StoreForwarder { inner };
    if forwarder.inner.in_flight.has_pending() {
        forwarder.trigger_close_executor();
        return;
    }
    let _transition = forwarder.inner.transition.lock().await;
    if forwarder.inner.activity.load(Ordering::SeqCst) != armed_at {
        return;
    }
    if forwarder.inner.current().is_some() {
        tracing::info!(
            idle_timeout = ?forwarder.inner.options.idle_timeout,
            "closing idle association"
        );
        forwarder.inner.close_now().await;
    }
}

/// Routes the responses to one C-STORE-RQ into the [ProgressState].
struct ForwardingHandler {
    progress: Arc<ProgressState>,
    guard: InFlightGuard,
    final_response: Option<oneshot::Sender<StoreResponse>>,
    answered: bool,
}

impl ResponseHandler for ForwardingHandler {
    fn on_response(&mut self, response: &StoreResponse) {
        self.progress.on_response(response);
        if !response.is_pending() {
            self.answered = true;
            self.guard.release();
            if let Some(tx) = self.final_response.take() {
                let _ = tx.send(response.clone());
            }
        }
    }
}

impl Drop for ForwardingHandler {
    fn drop(&mut self) {
        if !self.answered {
            self.progress.on_failure();
        }
    }
}
