#![allow(dead_code)]

use bytes::Bytes;
use oxiforward::{BytesSource, Endpoint, ForwardOptions};
use std::sync::Once;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        tracing::subscriber::set_global_default(
            tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .finish(),
        )
        .unwrap()
    })
}

pub fn endpoint() -> Endpoint {
    Endpoint::new("CALLING", "CALLED", "localhost", 11113)
}

/// Short waits so that tests giving up do not take minutes.
pub fn test_options() -> ForwardOptions {
    ForwardOptions {
        wait_sleep: Duration::from_millis(5),
        max_wait_loops: 1000,
        ..Default::default()
    }
}

pub fn object(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax: &str,
) -> Box<BytesSource> {
    Box::new(BytesSource {
        data: Bytes::from_static(b"\x08\x00\x18\x00\x00\x00\x00\x00"),
        sop_class_uid: sop_class_uid.to_string(),
        sop_instance_uid: sop_instance_uid.to_string(),
        transfer_syntax: transfer_syntax.to_string(),
    })
}
