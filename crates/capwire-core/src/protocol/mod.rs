//! Wire protocol shared by client and server.
//!
//! - **Envelope**: `{scope, channel, message}` plus the typed payload of each channel
//! - **Frame**: length-prefixed transport framing over any async byte stream

pub mod envelope;
pub mod frame;

pub use envelope::{
    CallPayload, Channel, Envelope, GetPayload, NotifyPayload, PromisePayload,
    SubscriptionPayload,
};
pub use frame::{decode_envelope, read_envelope, read_frame, write_envelope, write_frame};
