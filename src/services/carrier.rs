//! Carrier codec.
//!
//! Every chunk is stored remotely as `carrier ++ payload`, where the carrier
//! is a small PNG padded to exactly [`CARRIER_LEN`] bytes. Decoding never
//! inspects the prefix; only its length matters.

use bytes::{Bytes, BytesMut};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

/// Exact length of the carrier prefix. Changing it orphans every stored chunk.
pub const CARRIER_LEN: usize = 20 * 1024;

/// Layout tag persisted with each chunk record.
pub const CARRIER_VERSION: i64 = 1;

const CARRIER_WIDTH: u32 = 200;
const CARRIER_HEIGHT: u32 = 100;
const FRAME_WIDTH: u32 = 4;
const BACKGROUND: Rgba<u8> = Rgba([240, 240, 240, 255]);
const FOREGROUND: Rgba<u8> = Rgba([50, 50, 50, 255]);

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("truncated carrier: expected at least {expected} bytes, got {actual}")]
    TruncatedCarrier { expected: usize, actual: usize },
    #[error("encoded carrier is {0} bytes, larger than the fixed carrier length")]
    Oversized(usize),
    #[error("failed to encode carrier image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Builds and strips the fixed-size image prefix.
///
/// The encoded carrier is computed once and shared by every `wrap` call, so
/// every stored chunk starts with the same [`CARRIER_LEN`] bytes. Objects on
/// the remote host are therefore recognizable as ours, and chunks of
/// different files cannot be told apart by their prefix.
#[derive(Clone, Debug)]
pub struct CarrierCodec {
    carrier: Bytes,
}

impl CarrierCodec {
    /// Render the carrier image and pad it to [`CARRIER_LEN`].
    pub fn new() -> Result<Self, CarrierError> {
        let img = RgbaImage::from_fn(CARRIER_WIDTH, CARRIER_HEIGHT, |x, y| {
            let on_frame = x < FRAME_WIDTH
                || y < FRAME_WIDTH
                || x >= CARRIER_WIDTH - FRAME_WIDTH
                || y >= CARRIER_HEIGHT - FRAME_WIDTH;
            let on_rule = y == CARRIER_HEIGHT / 2 && (20..CARRIER_WIDTH - 20).contains(&x);
            if on_frame || on_rule {
                FOREGROUND
            } else {
                BACKGROUND
            }
        });

        let mut encoded = Vec::new();
        DynamicImage::ImageRgba8(img).write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?;
        if encoded.len() > CARRIER_LEN {
            return Err(CarrierError::Oversized(encoded.len()));
        }
        encoded.resize(CARRIER_LEN, 0);

        Ok(Self {
            carrier: Bytes::from(encoded),
        })
    }

    /// Length of the prefix written by [`wrap`](Self::wrap).
    pub fn carrier_len(&self) -> usize {
        self.carrier.len()
    }

    /// Produce `carrier ++ payload`.
    pub fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(self.carrier.len() + payload.len());
        out.extend_from_slice(&self.carrier);
        out.extend_from_slice(payload);
        out.freeze()
    }

    /// Drop the first [`CARRIER_LEN`] bytes of a fetched blob.
    pub fn unwrap(&self, blob: Bytes) -> Result<Bytes, CarrierError> {
        if blob.len() < CARRIER_LEN {
            return Err(CarrierError::TruncatedCarrier {
                expected: CARRIER_LEN,
                actual: blob.len(),
            });
        }
        Ok(blob.slice(CARRIER_LEN..))
    }

    /// Start an incremental unwrap over a blob that arrives in pieces.
    pub fn unwrapper(&self) -> Unwrapper {
        Unwrapper {
            remaining: CARRIER_LEN,
        }
    }
}

/// Strips the carrier prefix from a blob delivered as a sequence of pieces.
#[derive(Debug)]
pub struct Unwrapper {
    remaining: usize,
}

impl Unwrapper {
    /// Feed the next piece; returns the payload portion, if any.
    pub fn feed(&mut self, mut piece: Bytes) -> Option<Bytes> {
        if self.remaining > 0 {
            let skip = self.remaining.min(piece.len());
            self.remaining -= skip;
            piece = piece.slice(skip..);
        }
        (!piece.is_empty()).then_some(piece)
    }

    /// Signal end of the blob; fails if the prefix was never fully consumed.
    pub fn finish(&self) -> Result<(), CarrierError> {
        if self.remaining > 0 {
            return Err(CarrierError::TruncatedCarrier {
                expected: CARRIER_LEN,
                actual: CARRIER_LEN - self.remaining,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_is_a_png_of_fixed_length() {
        let codec = CarrierCodec::new().unwrap();
        assert_eq!(codec.carrier_len(), CARRIER_LEN);
        assert_eq!(&codec.wrap(b"")[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn wrap_prepends_exactly_the_carrier() {
        let codec = CarrierCodec::new().unwrap();
        for payload in [&b""[..], &b"x"[..], &[7u8; 4096][..]] {
            let wrapped = codec.wrap(payload);
            assert_eq!(wrapped.len(), CARRIER_LEN + payload.len());
            assert_eq!(&wrapped[CARRIER_LEN..], payload);
        }
    }

    #[test]
    fn unwrap_ignores_prefix_contents() {
        let codec = CarrierCodec::new().unwrap();
        let mut blob = vec![0xAB; CARRIER_LEN];
        blob.extend_from_slice(b"payload");
        assert_eq!(codec.unwrap(Bytes::from(blob)).unwrap(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn unwrap_rejects_short_blob() {
        let codec = CarrierCodec::new().unwrap();
        let err = codec
            .unwrap(Bytes::from(vec![0u8; CARRIER_LEN - 1]))
            .unwrap_err();
        assert!(matches!(
            err,
            CarrierError::TruncatedCarrier { actual, .. } if actual == CARRIER_LEN - 1
        ));
    }

    #[test]
    fn unwrap_of_bare_carrier_is_empty() {
        let codec = CarrierCodec::new().unwrap();
        assert!(codec.unwrap(codec.wrap(b"")).unwrap().is_empty());
    }

    #[test]
    fn unwrapper_handles_pieces_straddling_the_prefix() {
        let codec = CarrierCodec::new().unwrap();
        let wrapped = codec.wrap(b"hello world");
        let mut unwrapper = codec.unwrapper();
        let mut out = Vec::new();
        for piece in wrapped.chunks(3000) {
            if let Some(payload) = unwrapper.feed(Bytes::copy_from_slice(piece)) {
                out.extend_from_slice(&payload);
            }
        }
        unwrapper.finish().unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn unwrapper_reports_truncation() {
        let codec = CarrierCodec::new().unwrap();
        let mut unwrapper = codec.unwrapper();
        assert!(unwrapper.feed(Bytes::from(vec![0u8; 100])).is_none());
        assert!(matches!(
            unwrapper.finish(),
            Err(CarrierError::TruncatedCarrier { actual: 100, .. })
        ));
    }
}
