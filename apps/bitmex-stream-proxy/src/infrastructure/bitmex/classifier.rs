//! Ordinal Classifier
//!
//! Tags each upstream frame as noise, acknowledgement or data.
//!
//! The first [`HANDSHAKE_FRAMES`] frames of a connection (the welcome
//! banner) are discarded unconditionally. After that, classification is by
//! shape alone: a frame that decodes as an acknowledgement is routed to
//! correlation whatever its position, so any number of control requests can
//! be in flight at once.

use super::codec::{self, DecodeError, Decoded};

/// Frames discarded at the start of every connection.
pub const HANDSHAKE_FRAMES: u64 = 1;

/// A received payload and its 1-based position on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Position since the connection was established, starting at 1.
    pub ordinal: u64,
    /// Frame bytes.
    pub payload: Vec<u8>,
}

/// Per-connection frame classifier.
#[derive(Debug, Clone)]
pub struct OrdinalClassifier {
    received: u64,
    handshake: u64,
}

impl Default for OrdinalClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OrdinalClassifier {
    /// Classifier discarding [`HANDSHAKE_FRAMES`] leading frames.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_handshake(HANDSHAKE_FRAMES)
    }

    /// Classifier discarding `handshake` leading frames.
    #[must_use]
    pub const fn with_handshake(handshake: u64) -> Self {
        Self {
            received: 0,
            handshake,
        }
    }

    /// Frames seen so far.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    /// Assign the next ordinal to a payload.
    pub fn frame(&mut self, payload: impl Into<Vec<u8>>) -> RawFrame {
        self.received += 1;
        RawFrame {
            ordinal: self.received,
            payload: payload.into(),
        }
    }

    /// Classify a frame.
    ///
    /// # Errors
    ///
    /// Returns the codec's [`DecodeError`] for frames past the handshake
    /// that match no known shape.
    pub fn classify(&self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        if frame.ordinal <= self.handshake {
            tracing::debug!(ordinal = frame.ordinal, "Discarding handshake frame");
            return Ok(Decoded::Noise);
        }
        codec::decode(&frame.payload)
    }

    /// Assign an ordinal and classify in one step.
    ///
    /// # Errors
    ///
    /// See [`OrdinalClassifier::classify`].
    pub fn next(&mut self, payload: impl Into<Vec<u8>>) -> (u64, Result<Decoded, DecodeError>) {
        let frame = self.frame(payload);
        (frame.ordinal, self.classify(&frame))
    }
}
