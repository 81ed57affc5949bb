//! Log entry payload encoding.
//!
//! An entry is the protobuf encoding of a single [`WriteRequest`], the same
//! bytes a remote-write endpoint receives before transport compression, so a
//! log segment can be replayed without a separate format.

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::proto::{TimeSeries, WriteRequest};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed write request payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub fn encode(request: &WriteRequest) -> Vec<u8> {
    request.encode_to_vec()
}

pub fn decode(payload: Bytes) -> Result<WriteRequest, CodecError> {
    Ok(WriteRequest::decode(payload)?)
}

/// Put a request into a canonical order so that two requests carrying the
/// same series compare equal regardless of how labels, samples or series were
/// ordered when they were built.
pub fn canonicalize(request: &mut WriteRequest) {
    for series in &mut request.timeseries {
        series
            .labels
            .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));
        series.samples.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.value.total_cmp(&b.value))
        });
    }
    request.timeseries.sort_by_cached_key(TimeSeries::encode_to_vec);
}
