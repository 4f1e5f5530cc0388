//! A [Connector] which records every interaction instead of talking to a peer.

use async_trait::async_trait;
use oxiforward::{
    Association, AssociationError, Connector, Endpoint, ForwardOptions, PresentationContextSet,
    ResponseHandler, StoreRequest, StoreResponse,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Shared between the connector, its associations and the test.
pub struct Peer {
    pub connects: AtomicUsize,
    pub releases: AtomicUsize,
    pub socket_closes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub stores: AtomicUsize,
    /// Transfer syntaxes the peer supports. `None` means anything proposed is accepted.
    pub supported: Option<HashSet<String>>,
    pub refuse: AtomicBool,
    pub fail_release: AtomicBool,
    pub fail_socket_close: AtomicBool,
    pub status: AtomicU16,
    pub pending_responses: AtomicUsize,
    /// Each C-STORE waits for a permit before being answered.
    pub gate: Semaphore,
    pub proposals: Mutex<Vec<PresentationContextSet>>,
    pub events: Mutex<Vec<String>>,
}

impl Peer {
    pub fn new(supported: Option<&[&str]>) -> Arc<Self> {
        Self::with_permits(supported, Semaphore::MAX_PERMITS)
    }

    /// Like [Peer::new] but C-STOREs are held until [Peer::open_gate].
    pub fn gated(supported: Option<&[&str]>) -> Arc<Self> {
        Self::with_permits(supported, 0)
    }

    fn with_permits(supported: Option<&[&str]>, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            connects: Default::default(),
            releases: Default::default(),
            socket_closes: Default::default(),
            aborts: Default::default(),
            stores: Default::default(),
            supported: supported.map(|s| s.iter().map(|ts| ts.to_string()).collect()),
            refuse: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
            fail_socket_close: AtomicBool::new(false),
            status: AtomicU16::new(0x0000),
            pending_responses: AtomicUsize::new(0),
            gate: Semaphore::new(permits),
            proposals: Default::default(),
            events: Default::default(),
        })
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1024);
    }

    pub fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Number of calls to connect, release, wait_for_socket_close and abort.
    pub fn interactions(&self) -> usize {
        self.count(&self.connects)
            + self.count(&self.releases)
            + self.count(&self.socket_closes)
            + self.count(&self.aborts)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn last_proposal(&self) -> PresentationContextSet {
        self.proposals.lock().unwrap().last().cloned().unwrap()
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct MockConnector(pub Arc<Peer>);

#[async_trait]
impl Connector for MockConnector {
    type Association = MockAssociation;

    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _options: &ForwardOptions,
        contexts: &PresentationContextSet,
    ) -> Result<MockAssociation, AssociationError> {
        let peer = &self.0;
        let n = peer.connects.fetch_add(1, Ordering::SeqCst) + 1;
        peer.log(format!("connect {n}"));
        peer.proposals.lock().unwrap().push(contexts.clone());
        if peer.refuse.load(Ordering::SeqCst) {
            return Err(AssociationError::Timeout(Duration::from_secs(30)));
        }
        let mut accepted: HashMap<String, HashSet<String>> = HashMap::new();
        for pc in contexts.contexts() {
            let supported = peer
                .supported
                .as_ref()
                .is_none_or(|s| s.contains(&pc.transfer_syntax));
            if supported {
                accepted
                    .entry(pc.abstract_syntax)
                    .or_default()
                    .insert(pc.transfer_syntax);
            }
        }
        Ok(MockAssociation {
            peer: Arc::clone(peer),
            accepted,
            ready: AtomicBool::new(true),
            message_id: AtomicU16::new(1),
        })
    }
}

pub struct MockAssociation {
    peer: Arc<Peer>,
    accepted: HashMap<String, HashSet<String>>,
    ready: AtomicBool,
    message_id: AtomicU16,
}

#[async_trait]
impl Association for MockAssociation {
    fn is_ready_for_data_transfer(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn transfer_syntaxes_for(&self, abstract_syntax: &str) -> HashSet<String> {
        self.accepted
            .get(abstract_syntax)
            .cloned()
            .unwrap_or_default()
    }

    async fn store(
        &self,
        request: StoreRequest,
        mut handler: Box<dyn ResponseHandler>,
    ) -> Result<u16, AssociationError> {
        if !self.is_ready_for_data_transfer() {
            return Err(AssociationError::NotReady);
        }
        let message_id = self.message_id.fetch_add(1, Ordering::SeqCst);
        self.peer.stores.fetch_add(1, Ordering::SeqCst);
        self.peer.log(format!("store {}", request.sop_instance_uid));
        let _permit = self.peer.gate.acquire().await.unwrap();
        let mut response = StoreResponse {
            message_id,
            status: 0xFF00,
            affected_sop_instance_uid: request.sop_instance_uid.clone(),
            affected_sop_class_uid: request.abstract_syntax.clone(),
        };
        for _ in 0..self.peer.pending_responses.load(Ordering::SeqCst) {
            handler.on_response(&response);
        }
        response.status = self.peer.status.load(Ordering::SeqCst);
        self.peer.log(format!("stored {}", request.sop_instance_uid));
        handler.on_response(&response);
        Ok(message_id)
    }

    async fn release(&self) -> Result<(), AssociationError> {
        self.ready.store(false, Ordering::SeqCst);
        self.peer.releases.fetch_add(1, Ordering::SeqCst);
        self.peer.log("release".to_string());
        if self.peer.fail_release.load(Ordering::SeqCst) {
            return Err(AssociationError::CloseTimeout(Duration::from_secs(10)));
        }
        Ok(())
    }

    async fn wait_for_socket_close(&self) -> Result<(), AssociationError> {
        self.peer.socket_closes.fetch_add(1, Ordering::SeqCst);
        self.peer.log("socket closed".to_string());
        if self.peer.fail_socket_close.load(Ordering::SeqCst) {
            return Err(AssociationError::Closed);
        }
        Ok(())
    }

    async fn abort(&self) -> Result<(), AssociationError> {
        self.ready.store(false, Ordering::SeqCst);
        self.peer.aborts.fetch_add(1, Ordering::SeqCst);
        self.peer.log("abort".to_string());
        Ok(())
    }
}
