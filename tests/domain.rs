use std::path::Path;

use framepull::domain::{JobState, ResultLocator, TransportKind, is_media_file};
use framepull::error::{JobError, JobErrorKind, PullError};

#[test]
fn recognized_media_extensions() {
    for name in ["a.jpg", "b.JPEG", "c.png", "d.gif", "e.bmp", "f.tiff", "g.webp", "h.HEIC", "i.heif"] {
        assert!(is_media_file(Path::new(name)), "{name}");
    }
    for name in ["a.txt", "b.mp4", "c", ".jpg.bak", "archive.zip"] {
        assert!(!is_media_file(Path::new(name)), "{name}");
    }
}

#[test]
fn locator_is_trimmed() {
    let locator: ResultLocator = "  /download/abc \n".parse().unwrap();
    assert_eq!(locator.as_str(), "/download/abc");
    assert_eq!(locator.to_string(), "/download/abc");
}

#[test]
fn only_transport_failures_are_transient() {
    for kind in [
        TransportKind::Timeout,
        TransportKind::ConnectionLost,
        TransportKind::NotConnected,
    ] {
        assert!(PullError::transport(kind, "x").is_transient());
    }
    assert!(!PullError::transport(TransportKind::Other, "x").is_transient());
    assert!(!PullError::EmptyFile.is_transient());
    assert!(!PullError::ServerRejected {
        status: 503,
        message: "busy".to_string()
    }
    .is_transient());
}

#[test]
fn job_error_keeps_kind_and_message() {
    let error = JobError::from(&PullError::CorruptArchive("bad header".to_string()));
    assert_eq!(error.kind, JobErrorKind::ExtractionFailed);
    assert_eq!(error.to_string(), "corrupt archive: bad header");

    let json = serde_json::to_value(JobError::from(&PullError::ServerRejected {
        status: 404,
        message: "gone".to_string(),
    }))
    .unwrap();
    assert_eq!(json["kind"]["kind"], "server_rejected");
    assert_eq!(json["kind"]["detail"], 404);
}

#[test]
fn state_labels() {
    assert_eq!(JobState::AwaitingDownload.to_string(), "awaiting download");
    assert_eq!(
        serde_json::to_value(JobState::AwaitingDownload).unwrap(),
        "awaiting_download"
    );
    assert!(JobState::Failed.is_terminal());
    assert!(!JobState::Idle.is_running());
}
