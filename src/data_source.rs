//! Objects to be stored, as opaque producers of data set bytes.

use crate::types::trim_uid;
use bytes::Bytes;
use camino::Utf8Path;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, open_file};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::io::Write;

#[derive(thiserror::Error, Debug)]
pub enum DataSourceError {
    #[error("Unknown transfer syntax {0}")]
    UnknownTransferSyntax(String),

    #[error("Cannot transcode from {from} to {to}")]
    UnsupportedTranscode { from: String, to: String },

    #[error(transparent)]
    Write(#[from] dicom::object::WriteError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// A DICOM object which can be written as a data set in a given transfer syntax.
///
/// Pixel data transcoding is up to the implementation.
pub trait DataSource: Send + 'static {
    fn sop_class_uid(&self) -> &str;

    fn sop_instance_uid(&self) -> &str;

    /// The transfer syntax the object is natively encoded with.
    fn transfer_syntax(&self) -> &str;

    /// Write the data set (without file meta group) encoded in `transfer_syntax`.
    fn write_dataset(&self, out: &mut dyn Write, transfer_syntax: &str)
    -> Result<(), DataSourceError>;
}

/// A DICOM file object held in memory.
///
/// Can be re-encoded into another transfer syntax only when neither involves a
/// pixel data codec.
pub struct DicomObjectSource {
    obj: DefaultDicomObject,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax: String,
}

impl DicomObjectSource {
    pub fn new(obj: DefaultDicomObject) -> Self {
        let meta = obj.meta();
        let sop_class_uid = trim_uid(&meta.media_storage_sop_class_uid).to_string();
        let sop_instance_uid = trim_uid(&meta.media_storage_sop_instance_uid).to_string();
        let transfer_syntax = trim_uid(&meta.transfer_syntax).to_string();
        Self {
            obj,
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax,
        }
    }

    pub fn open(path: &Utf8Path) -> Result<Self, dicom::object::ReadError> {
        open_file(path).map(Self::new)
    }
}

impl DataSource for DicomObjectSource {
    fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    fn write_dataset(
        &self,
        out: &mut dyn Write,
        transfer_syntax: &str,
    ) -> Result<(), DataSourceError> {
        let target = TransferSyntaxRegistry
            .get(transfer_syntax)
            .ok_or_else(|| DataSourceError::UnknownTransferSyntax(transfer_syntax.to_string()))?;
        if target.uid() != self.transfer_syntax {
            let native = TransferSyntaxRegistry
                .get(&self.transfer_syntax)
                .ok_or_else(|| {
                    DataSourceError::UnknownTransferSyntax(self.transfer_syntax.clone())
                })?;
            if !(native.is_codec_free() && target.is_codec_free()) {
                return Err(DataSourceError::UnsupportedTranscode {
                    from: self.transfer_syntax.clone(),
                    to: transfer_syntax.to_string(),
                });
            }
        }
        self.obj.write_dataset_with_ts(out, target)?;
        Ok(())
    }
}

/// A data set already encoded by someone else. Can only be sent as is.
pub struct BytesSource {
    pub data: Bytes,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
}

impl DataSource for BytesSource {
    fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    fn write_dataset(
        &self,
        out: &mut dyn Write,
        transfer_syntax: &str,
    ) -> Result<(), DataSourceError> {
        if trim_uid(transfer_syntax) != trim_uid(&self.transfer_syntax) {
            return Err(DataSourceError::UnsupportedTranscode {
                from: self.transfer_syntax.clone(),
                to: transfer_syntax.to_string(),
            });
        }
        out.write_all(&self.data)?;
        Ok(())
    }
}
