//! [Connector] implementation using the async client association of `dicom-ul`.
//!
//! C-STORE request handling is based on
//! https://github.com/Enet4/dicom-rs/blob/801553a2112950930d98ac20c331810461629990/storescu/src/store_async.rs

use crate::association::{Association, Connector, ResponseHandler, StoreRequest, StoreResponse};
use crate::association_error::{AssociationError, AssociationError::*};
use crate::presentation_context::{PresentationContextSet, ProposedContext};
use crate::settings::{Endpoint, ForwardOptions};
use crate::types::trim_uid;
use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{StandardDataDictionary, tags};
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_ul::pdu::{AbortRQSource, PDataValue, PDataValueType};
use dicom_ul::{ClientAssociation, ClientAssociationOptions, Pdu};
use opentelemetry::global::BoxedSpan;
use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::{KeyValue, global};
use opentelemetry_semantic_conventions as semconv;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type Scu = ClientAssociation<TcpStream>;

/// Opens associations over TCP with `dicom-ul`.
///
/// Dropping a `dicom-ul` client association blocks in place, so the associations must
/// live on a multi-threaded Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomUlConnector;

#[async_trait]
impl Connector for DicomUlConnector {
    type Association = DicomUlAssociation;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ForwardOptions,
        contexts: &PresentationContextSet,
    ) -> Result<DicomUlAssociation, AssociationError> {
        let proposed: Vec<ProposedContext> = contexts.contexts().collect();
        if proposed.is_empty() {
            return Err(NothingToPropose);
        }
        if contexts.relationship_negotiation().next().is_some() {
            tracing::warn!(
                aec = endpoint.aec.as_str(),
                "SOP class relationship negotiation is not supported by dicom-ul, not proposing it"
            );
        }
        let tracer = global::tracer(env!("CARGO_PKG_NAME"));
        let mut span = tracer.start("association");
        span.set_attributes(vec![
            KeyValue::new("aet", endpoint.aet.to_string()),
            KeyValue::new("aec", endpoint.aec.to_string()),
            KeyValue::new(semconv::trace::SERVER_ADDRESS, endpoint.host.clone()),
            KeyValue::new(semconv::trace::SERVER_PORT, endpoint.port as i64),
        ]);

        let scu_init = proposed.iter().fold(
            ClientAssociationOptions::new()
                .calling_ae_title(endpoint.aet.as_str())
                .called_ae_title(endpoint.aec.as_str())
                .max_pdu_length(options.max_pdu_length)
                .strict(options.strict),
            |scu_init, pc| {
                scu_init.with_presentation_context(
                    pc.abstract_syntax.as_str(),
                    vec![pc.transfer_syntax.as_str()],
                )
            },
        );
        let address = endpoint.address();
        let establish = scu_init.establish_with_async(&address);
        let scu = match tokio::time::timeout(options.connect_timeout, establish).await {
            Ok(Ok(scu)) => scu,
            Ok(Err(e)) => {
                span.set_status(Status::error(e.to_string()));
                span.end();
                return Err(CouldNotEstablish(e));
            }
            Err(_) => {
                span.set_status(Status::error("timeout"));
                span.end();
                return Err(Timeout(options.connect_timeout));
            }
        };

        let accepted = accepted_contexts(&proposed, &scu);
        tracing::debug!(
            aec = endpoint.aec.as_str(),
            proposed = proposed.len(),
            accepted = accepted.len(),
            "association established"
        );
        Ok(DicomUlAssociation {
            scu: Mutex::new(Some(scu)),
            accepted,
            ready: AtomicBool::new(true),
            closing: CancellationToken::new(),
            message_id: AtomicU16::new(1),
            close_timeout: options.close_timeout,
            span: std::sync::Mutex::new(span),
        })
    }
}

/// An accepted presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AcceptedContext {
    id: u8,
    abstract_syntax: String,
    transfer_syntax: String,
}

/// Match the accepted presentation contexts with what we proposed.
///
/// Contexts are proposed with odd IDs in order: 1, 3, 5, ...
fn accepted_contexts(proposed: &[ProposedContext], scu: &Scu) -> Vec<AcceptedContext> {
    scu.presentation_contexts()
        .iter()
        .filter_map(|pc| {
            let index = (pc.id as usize).checked_sub(1)? / 2;
            proposed.get(index).map(|p| AcceptedContext {
                id: pc.id,
                abstract_syntax: p.abstract_syntax.clone(),
                transfer_syntax: trim_uid(&pc.transfer_syntax).to_string(),
            })
        })
        .collect()
}

/// A `dicom-ul` client association.
///
/// Requests are sent one at a time. Closing interrupts the request in progress.
pub struct DicomUlAssociation {
    scu: Mutex<Option<Scu>>,
    accepted: Vec<AcceptedContext>,
    ready: AtomicBool,
    /// Cancelled once the association is being released or aborted.
    closing: CancellationToken,
    /// Only read and written while holding `scu`.
    message_id: AtomicU16,
    close_timeout: Duration,
    span: std::sync::Mutex<BoxedSpan>,
}

impl DicomUlAssociation {
    fn context_id(&self, abstract_syntax: &str, transfer_syntax: &str) -> Option<u8> {
        self.accepted
            .iter()
            .find(|pc| {
                pc.abstract_syntax == abstract_syntax && pc.transfer_syntax == transfer_syntax
            })
            .map(|pc| pc.id)
    }

    /// Take the association out, no more requests can be sent afterwards.
    ///
    /// A store waiting for its response gives up the association with [Closed].
    async fn take_scu(&self) -> Option<Scu> {
        self.ready.store(false, Ordering::SeqCst);
        self.closing.cancel();
        self.scu.lock().await.take()
    }

    /// Abort a connection which can no longer be used.
    async fn discard(&self, scu: Scu) {
        if let Err(e) = abort_scu(scu, self.close_timeout).await {
            tracing::debug!(message = e.to_string(), "could not abort connection");
        }
    }

    fn end_span(&self, status: Status) {
        let mut span = self.span.lock().unwrap_or_else(|e| e.into_inner());
        span.set_status(status);
        span.end();
    }
}

#[async_trait]
impl Association for DicomUlAssociation {
    fn is_ready_for_data_transfer(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn transfer_syntaxes_for(&self, abstract_syntax: &str) -> HashSet<String> {
        self.accepted
            .iter()
            .filter(|pc| pc.abstract_syntax == abstract_syntax)
            .map(|pc| pc.transfer_syntax.clone())
            .collect()
    }

    async fn store(
        &self,
        request: StoreRequest,
        mut handler: Box<dyn ResponseHandler>,
    ) -> Result<u16, AssociationError> {
        let pc_id = self
            .context_id(&request.abstract_syntax, &request.transfer_syntax)
            .ok_or_else(|| NoPresentationContext {
                abstract_syntax: request.abstract_syntax.clone(),
                transfer_syntax: request.transfer_syntax.clone(),
            })?;
        let mut message = StoreMessage::encode(request)?;
        let mut guard = self.scu.lock().await;
        if self.closing.is_cancelled() {
            return Err(NotReady);
        }
        let scu = guard.as_mut().ok_or(NotReady)?;
        let message_id = self.message_id.load(Ordering::SeqCst);
        message.set_message_id(message_id)?;
        self.message_id.store(message_id.wrapping_add(1), Ordering::SeqCst);

        let result = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(Closed),
            result = message.send(scu, pc_id, handler.as_mut()) => result,
        };
        match result {
            Ok(()) => Ok(message_id),
            // the closing side takes the association over
            Err(Closed) => Err(Closed),
            Err(e) => {
                self.ready.store(false, Ordering::SeqCst);
                if let Some(scu) = guard.take() {
                    self.discard(scu).await;
                }
                Err(e)
            }
        }
    }

    async fn release(&self) -> Result<(), AssociationError> {
        match self.take_scu().await {
            Some(scu) => release_scu(scu, self.close_timeout).await,
            None => Ok(()),
        }
    }

    async fn wait_for_socket_close(&self) -> Result<(), AssociationError> {
        if let Some(mut scu) = self.take_scu().await {
            let _ = scu.inner_stream().shutdown().await;
        }
        self.end_span(Status::Ok);
        Ok(())
    }

    async fn abort(&self) -> Result<(), AssociationError> {
        let scu = self.take_scu().await;
        self.end_span(Status::error("aborted"));
        match scu {
            Some(scu) => abort_scu(scu, self.close_timeout).await,
            None => Ok(()),
        }
    }
}

/// Exchange A-RELEASE-RQ and A-RELEASE-RP, then shut the connection down.
///
/// Responses to an interrupted C-STORE-RQ arriving before the A-RELEASE-RP are skipped.
/// The connection is shut down before the association is dropped, so that dropping it
/// does not attempt another release.
async fn release_scu(mut scu: Scu, close_timeout: Duration) -> Result<(), AssociationError> {
    let exchange = async {
        scu.send(&Pdu::ReleaseRQ).await.map_err(Release)?;
        loop {
            match scu.receive().await.map_err(Release)? {
                Pdu::ReleaseRP => return Ok(()),
                Pdu::PData { .. } => continue,
                pdu => return Err(UnexpectedPdu(pdu.short_description().to_string())),
            }
        }
    };
    let result = match tokio::time::timeout(close_timeout, exchange).await {
        Ok(released) => released,
        Err(_) => Err(CloseTimeout(close_timeout)),
    };
    let _ = scu.inner_stream().shutdown().await;
    result
}

/// Send an A-ABORT, then shut the connection down.
async fn abort_scu(mut scu: Scu, close_timeout: Duration) -> Result<(), AssociationError> {
    let pdu = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    let result = match tokio::time::timeout(close_timeout, scu.send(&pdu)).await {
        Ok(sent) => sent.map_err(Abort),
        Err(_) => Err(CloseTimeout(close_timeout)),
    };
    let _ = scu.inner_stream().shutdown().await;
    result
}

/// An encoded C-STORE-RQ.
struct StoreMessage {
    message_id: u16,
    priority: u16,
    sop_class_uid: String,
    sop_instance_uid: String,
    cmd_data: Vec<u8>,
    object_data: Vec<u8>,
}

impl StoreMessage {
    /// Encode the data set. The command is written by [StoreMessage::set_message_id].
    fn encode(request: StoreRequest) -> Result<Self, AssociationError> {
        let mut object_data = Vec::with_capacity(2048);
        request
            .data
            .write_dataset(&mut object_data, &request.transfer_syntax)?;
        Ok(Self {
            message_id: 0,
            priority: request.priority.value(),
            sop_class_uid: request.abstract_syntax,
            sop_instance_uid: request.sop_instance_uid,
            cmd_data: Vec::new(),
            object_data,
        })
    }

    fn set_message_id(&mut self, message_id: u16) -> Result<(), AssociationError> {
        let cmd = store_req_command(
            &self.sop_class_uid,
            &self.sop_instance_uid,
            message_id,
            self.priority,
        );
        let mut cmd_data = Vec::with_capacity(128);
        cmd.write_dataset_with_ts(&mut cmd_data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
        self.message_id = message_id;
        self.cmd_data = cmd_data;
        Ok(())
    }

    /// Send the request and read responses until the final one.
    async fn send(
        self,
        scu: &mut Scu,
        pc_id: u8,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), AssociationError> {
        let nbytes = self.cmd_data.len() + self.object_data.len();
        if nbytes < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
            let pdu = Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id: pc_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: self.cmd_data,
                    },
                    PDataValue {
                        presentation_context_id: pc_id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: self.object_data,
                    },
                ],
            };
            scu.send(&pdu)
                .await
                .map_err(|e| CannotSend("Failed to send C-STORE-RQ", e))?;
        } else {
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: self.cmd_data,
                }],
            };
            scu.send(&pdu)
                .await
                .map_err(|e| CannotSend("Failed to send C-STORE-RQ command", e))?;
            {
                let mut pdata = scu.send_pdata(pc_id).await;
                pdata.write_all(&self.object_data).await?;
            }
        }

        loop {
            match scu.receive().await.map_err(CannotReceive)? {
                Pdu::PData { data } => {
                    let Some(data_value) = data.first() else {
                        continue;
                    };
                    if data_value.value_type != PDataValueType::Command {
                        continue;
                    }
                    let response = read_store_response(
                        &data_value.data,
                        self.message_id,
                        &self.sop_class_uid,
                        &self.sop_instance_uid,
                    )?;
                    handler.on_response(&response);
                    if !response.is_pending() {
                        return Ok(());
                    }
                }
                Pdu::AbortRQ { .. } => return Err(Aborted),
                pdu => return Err(UnexpectedPdu(pdu.short_description().to_string())),
            }
        }
    }
}

/// Read a C-STORE-RSP, the affected UIDs default to those of the request.
fn read_store_response(
    data: &[u8],
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> Result<StoreResponse, AssociationError> {
    let cmd_obj =
        InMemDicomObject::read_dataset_with_ts(data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
    let status = cmd_obj
        .get(tags::STATUS)
        .ok_or(MissingStatus)?
        .to_int::<u16>()
        .map_err(|_| MissingStatus)?;
    let uid_or = |tag, default: &str| {
        cmd_obj
            .get(tag)
            .and_then(|e| e.to_str().ok())
            .map(|s| trim_uid(&s).to_string())
            .unwrap_or_else(|| default.to_string())
    };
    Ok(StoreResponse {
        message_id,
        status,
        affected_sop_instance_uid: uid_or(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
        affected_sop_class_uid: uid_or(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
    })
}

fn store_req_command(
    storage_sop_class_uid: &str,
    storage_sop_instance_uid: &str,
    message_id: u16,
    priority: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        // SOP Class UID
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_class_uid),
        ),
        // command field
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        // message ID
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        //priority
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority])),
        // data set type
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        // affected SOP Instance UID
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_instance_uid),
        ),
    ])
}
