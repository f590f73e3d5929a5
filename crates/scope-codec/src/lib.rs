//! Frame Codec (C1): decodes the header JSON record carried on part 1 of a
//! stream-link message and the JPEG payload carried on part 2, grounded on
//! `smartscope-core`'s `decode_mjpeg` (turbojpeg `Decompressor`) and its own
//! multipart header parsing.

use scope_core::error::DecodeError;
use scope_core::types::{CameraIndex, Frame, FrameHeader};
use serde::Deserialize;
use turbojpeg::{Decompressor, Image, PixelFormat};

/// Raw fields read straight off the wire before they are validated into a
/// [`FrameHeader`]. Mirrors §6.1/§6.2: only `camera`, `timestamp`, `format`
/// are mandatory.
#[derive(Debug, Deserialize)]
struct RawHeader {
    camera: Option<u8>,
    timestamp: Option<f64>,
    format: Option<String>,
    pattern_index: Option<i32>,
    scan_id: Option<String>,
    server_timestamp: Option<f64>,
    pattern_name: Option<String>,
    #[serde(default)]
    is_scan_frame: bool,
}

/// Parses the header byte buffer into a [`FrameHeader`]. Fails with
/// `MalformedHeader` if the JSON is invalid, or if `camera`, `timestamp` or
/// `format` is missing.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, DecodeError> {
    let raw: RawHeader = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::MalformedHeader(format!("invalid header JSON: {e}")))?;

    let camera_raw = raw
        .camera
        .ok_or_else(|| DecodeError::MalformedHeader("missing field: camera".to_string()))?;
    let camera = CameraIndex::from_u8(camera_raw).ok_or_else(|| {
        DecodeError::MalformedHeader(format!("invalid camera index: {camera_raw}"))
    })?;
    let timestamp = raw
        .timestamp
        .ok_or_else(|| DecodeError::MalformedHeader("missing field: timestamp".to_string()))?;
    let format = raw
        .format
        .ok_or_else(|| DecodeError::MalformedHeader("missing field: format".to_string()))?;

    Ok(FrameHeader {
        camera,
        pattern_index: raw.pattern_index.unwrap_or(-1),
        scan_id: raw.scan_id,
        timestamp,
        server_timestamp: raw.server_timestamp,
        format,
        pattern_name: raw.pattern_name,
        is_scan_frame: raw.is_scan_frame,
    })
}

/// Decodes a JPEG payload into a [`Frame`], preserving whatever channel
/// count the payload carries. Only `format == "jpeg"` is supported; any
/// other tag fails with `UnsupportedFormat`. A zero-size or undecodable
/// payload fails with `DecodeFailed` and never panics.
pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Frame, DecodeError> {
    if header.format != "jpeg" {
        return Err(DecodeError::UnsupportedFormat(header.format.clone()));
    }
    if payload.is_empty() {
        return Err(DecodeError::DecodeFailed("empty payload".to_string()));
    }

    let mut decompressor = Decompressor::new()
        .map_err(|e| DecodeError::DecodeFailed(format!("failed to create decompressor: {e}")))?;

    let jpeg_header = decompressor
        .read_header(payload)
        .map_err(|e| DecodeError::DecodeFailed(format!("failed to read jpeg header: {e}")))?;

    let width = jpeg_header.width;
    let height = jpeg_header.height;
    if width == 0 || height == 0 {
        return Err(DecodeError::DecodeFailed(
            "jpeg header reports a zero-size image".to_string(),
        ));
    }

    // A grayscale source (single-component JPEG) decodes to GRAY; anything
    // else decodes to packed RGB. No colour-space conversion beyond what
    // turbojpeg performs to reach one of these two target layouts.
    let (channels, pixel_format) = if jpeg_header.pixel_format == PixelFormat::GRAY {
        (1u8, PixelFormat::GRAY)
    } else {
        (3u8, PixelFormat::RGB)
    };

    let pitch = width * channels as usize;
    let mut pixels = vec![0u8; pitch * height];

    let output_image = Image {
        pixels: &mut pixels[..],
        width,
        pitch,
        height,
        format: pixel_format,
    };

    decompressor
        .decompress(payload, output_image)
        .map_err(|e| DecodeError::DecodeFailed(format!("jpeg decode failed: {e}")))?;

    Ok(Frame {
        width: width as u32,
        height: height as u32,
        channels,
        data: pixels,
        timestamp: header.timestamp,
    })
}

/// Decodes a complete `(header_bytes, payload_bytes)` stream-link message.
pub fn decode(header_bytes: &[u8], payload: &[u8]) -> Result<(FrameHeader, Frame), DecodeError> {
    let header = decode_header(header_bytes)?;
    let frame = decode_payload(&header, payload)?;
    Ok((header, frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header_json() -> Vec<u8> {
        br#"{"camera":0,"timestamp":1.5,"format":"jpeg","pattern_index":3}"#.to_vec()
    }

    #[test]
    fn decode_header_parses_mandatory_and_optional_fields() {
        let header = decode_header(&sample_header_json()).unwrap();
        assert_eq!(header.camera, CameraIndex::Left);
        assert_eq!(header.pattern_index, 3);
        assert!((header.timestamp - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_header_defaults_pattern_index_to_preview() {
        let bytes = br#"{"camera":1,"timestamp":0.2,"format":"jpeg"}"#;
        let header = decode_header(bytes).unwrap();
        assert!(header.is_preview());
    }

    #[test]
    fn decode_header_rejects_missing_mandatory_field() {
        let bytes = br#"{"camera":0,"format":"jpeg"}"#;
        let err = decode_header(bytes).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedHeader(_)));
    }

    #[test]
    fn decode_header_rejects_invalid_json() {
        let err = decode_header(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedHeader(_)));
    }

    #[test]
    fn decode_payload_rejects_unsupported_format() {
        let header = FrameHeader {
            camera: CameraIndex::Left,
            pattern_index: -1,
            scan_id: None,
            timestamp: 0.0,
            server_timestamp: None,
            format: "png".to_string(),
            pattern_name: None,
            is_scan_frame: false,
        };
        let err = decode_payload(&header, b"anything").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(_)));
    }

    #[test]
    fn decode_payload_rejects_empty_payload() {
        let header = FrameHeader {
            camera: CameraIndex::Left,
            pattern_index: -1,
            scan_id: None,
            timestamp: 0.0,
            server_timestamp: None,
            format: "jpeg".to_string(),
            pattern_name: None,
            is_scan_frame: false,
        };
        let err = decode_payload(&header, &[]).unwrap_err();
        assert!(matches!(err, DecodeError::DecodeFailed(_)));
    }
}
