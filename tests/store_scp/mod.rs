//! A minimal storage SCP listening on localhost, to send DICOM objects to.
//!
//! Request handling is based on
//! https://github.com/Enet4/dicom-rs/blob/dbd41ed3a0d1536747c6b8ea2b286e4c6e8ccc8a/storescp/src/main.rs

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{StandardDataDictionary, tags};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::ul::association::server::AcceptAny;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{Pdu, ServerAssociationOptions};
use std::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// An object received by the SCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
    pub message_id: u16,
}

pub struct StoreScp {
    pub port: u16,
    pub received: UnboundedReceiver<Received>,
}

/// How the SCP reacts to C-STORE requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Answer,
    /// Never send a C-STORE-RSP. Releases are still answered.
    Ignore,
    /// Close the connection upon the first C-STORE-RQ, then answer normally.
    HangUpOnce,
}

impl StoreScp {
    /// Accept associations in a background thread, supporting only `transfer_syntaxes`.
    pub fn spawn(aet: &str, transfer_syntaxes: &[&str]) -> Self {
        Self::spawn_with(aet, transfer_syntaxes, Behaviour::Answer)
    }

    pub fn spawn_with(aet: &str, transfer_syntaxes: &[&str], behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = transfer_syntaxes.iter().fold(
            ServerAssociationOptions::new()
                .accept_any()
                .ae_title(aet.to_string())
                .strict(false)
                .promiscuous(true),
            |options, ts| options.with_transfer_syntax(ts.to_string()),
        );
        let (tx, rx) = unbounded_channel();
        std::thread::spawn(move || {
            let mut behaviour = behaviour;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if let Err(e) = handle_association(stream, &options, &tx, behaviour) {
                    tracing::warn!(message = e.to_string(), "store SCP association error");
                }
                if behaviour == Behaviour::HangUpOnce {
                    behaviour = Behaviour::Answer;
                }
            }
        });
        Self { port, received: rx }
    }
}

fn handle_association(
    scu_stream: TcpStream,
    options: &ServerAssociationOptions<AcceptAny>,
    channel: &UnboundedSender<Received>,
    behaviour: Behaviour,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut association = options.establish(scu_stream)?;
    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid = 1;
    let mut sop_class_uid = "".to_string();
    let mut sop_instance_uid = "".to_string();
    // commands are always in implict VR LE
    let cmd_ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();

    while let Some(pdu) = bubble_no_pdu(association.receive())? {
        match pdu {
            Pdu::PData { data } => {
                for mut pdv in data {
                    match pdv.value_type {
                        PDataValueType::Command => {
                            let obj =
                                InMemDicomObject::read_dataset_with_ts(&pdv.data[..], &cmd_ts)?;
                            msgid = obj.element(tags::MESSAGE_ID)?.to_int()?;
                            sop_class_uid = obj
                                .element(tags::AFFECTED_SOP_CLASS_UID)?
                                .to_str()?
                                .trim_end_matches('\0')
                                .to_string();
                            sop_instance_uid = obj
                                .element(tags::AFFECTED_SOP_INSTANCE_UID)?
                                .to_str()?
                                .trim_end_matches('\0')
                                .to_string();
                            instance_buffer.clear();
                            if behaviour == Behaviour::HangUpOnce {
                                // dropping the association closes the connection
                                return Ok(());
                            }
                        }
                        PDataValueType::Data => {
                            instance_buffer.append(&mut pdv.data);
                            if !pdv.is_last {
                                continue;
                            }
                            let ts = association
                                .presentation_contexts()
                                .iter()
                                .find(|pc| pc.id == pdv.presentation_context_id)
                                .map(|pc| pc.transfer_syntax.trim_end_matches('\0').to_string())
                                .ok_or("unknown presentation context")?;
                            let obj = InMemDicomObject::read_dataset_with_ts(
                                instance_buffer.as_slice(),
                                TransferSyntaxRegistry.get(&ts).ok_or("unknown transfer syntax")?,
                            )?;
                            let stored_uid = obj.element(tags::SOP_INSTANCE_UID)?.to_str()?;
                            let status = if stored_uid.trim_end_matches('\0') == sop_instance_uid {
                                0x0000
                            } else {
                                0xA900
                            };
                            channel.send(Received {
                                sop_instance_uid: sop_instance_uid.clone(),
                                transfer_syntax: ts,
                                message_id: msgid,
                            })?;
                            if behaviour == Behaviour::Ignore {
                                continue;
                            }

                            let rsp = create_cstore_response(
                                msgid,
                                &sop_class_uid,
                                &sop_instance_uid,
                                status,
                            );
                            let mut rsp_data = Vec::new();
                            rsp.write_dataset_with_ts(&mut rsp_data, &cmd_ts)?;
                            association.send(&Pdu::PData {
                                data: vec![PDataValue {
                                    presentation_context_id: pdv.presentation_context_id,
                                    value_type: PDataValueType::Command,
                                    is_last: true,
                                    data: rsp_data,
                                }],
                            })?;
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP)?;
            }
            Pdu::AbortRQ { .. } => return Ok(()),
            pdu => return Err(format!("unexpected PDU: {}", pdu.short_description()).into()),
        }
    }
    Ok(())
}

fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Returns `None` if source is [dicom::ul::pdu::reader::Error::NoPduAvailable]
fn bubble_no_pdu(
    pdu: Result<Pdu, dicom::ul::association::server::Error>,
) -> Result<Option<Pdu>, dicom::ul::association::server::Error> {
    pdu.map(Some).or_else(|e| {
        if let dicom::ul::association::server::Error::Receive { source } = &e {
            if matches!(source, dicom::ul::pdu::reader::Error::NoPduAvailable { .. }) {
                return Ok(None);
            }
        }
        Err(e)
    })
}

/// A CT image object with `pixel_data_len` bytes of pixel data.
pub fn ct_object(
    sop_instance_uid: &str,
    transfer_syntax: &str,
    pixel_data_len: usize,
) -> DefaultDicomObject {
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(crate::helpers::CT_IMAGE_STORAGE),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("OXIFORWARDTEST")),
        DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(vec![0x5Au8; pixel_data_len]),
        ),
    ]);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(crate::helpers::CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax)
        .build()
        .unwrap();
    obj.with_exact_meta(meta)
}
