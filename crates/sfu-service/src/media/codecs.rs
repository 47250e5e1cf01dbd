//! Codecs every router is created with.
//!
//! One audio codec and several video codecs so clients on different platforms
//! can negotiate something they support in hardware.

use super::rtp::{MediaKind, RtcpFeedback, RtpCodecCapability};
use serde_json::{Map, Value};

fn params(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
        RtcpFeedback::new("transport-cc", ""),
    ]
}

fn video(mime_type: &str, parameters: Map<String, Value>) -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: mime_type.to_string(),
        preferred_payload_type: None,
        clock_rate: 90000,
        channels: None,
        parameters,
        rtcp_feedback: video_feedback(),
    }
}

/// Opus audio plus VP8, VP9 and two H.264 profiles.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: params(&[("useinbandfec", Value::from(1))]),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        },
        video("video/VP8", Map::new()),
        video("video/VP9", params(&[("profile-id", Value::from(2))])),
        video(
            "video/H264",
            params(&[
                ("packetization-mode", Value::from(1)),
                ("profile-level-id", Value::from("4d0032")),
                ("level-asymmetry-allowed", Value::from(1)),
            ]),
        ),
        video(
            "video/H264",
            params(&[
                ("packetization-mode", Value::from(1)),
                ("profile-level-id", Value::from("42e01f")),
                ("level-asymmetry-allowed", Value::from(1)),
            ]),
        ),
    ]
}
