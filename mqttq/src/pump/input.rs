//! Input pump: the only reader of a connection.
//!
//! Reads one frame at a time and runs it through the reflex chain. The next
//! frame is not read until the current dispatch has finished.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{LinkContext, PumpExit};
use crate::error::{DisconnectReason, Error};
use crate::protocol::codec::read_fixed_header_from;
use crate::reflex::{Outcome, ReflexChain};

/// Reader loop of one connection.
pub struct InputPump<R> {
    ctx: Arc<LinkContext>,
    reader: R,
    chain: Arc<ReflexChain>,
}

impl<R: AsyncRead + Unpin + Send> InputPump<R> {
    pub fn new(ctx: Arc<LinkContext>, reader: R, chain: Arc<ReflexChain>) -> Self {
        Self { ctx, reader, chain }
    }

    pub async fn run(mut self, stop: CancellationToken, close: CancellationToken) -> PumpExit {
        loop {
            let header = tokio::select! {
                biased;
                _ = close.cancelled() => return Ok(()),
                _ = stop.cancelled() => return Ok(()),
                r = read_fixed_header_from(&mut self.reader) => r,
            };
            let header = match header {
                Ok(Some(header)) => header,
                Ok(None) => {
                    debug!("broker closed the stream");
                    return Err(DisconnectReason::RemoteDisconnected);
                }
                Err(e) => return Err(DisconnectReason::from_error(&e)),
            };

            let len = header.remaining_length as usize;
            let max = self.ctx.config.max_packet_size;
            if len > max {
                let err = Error::PacketTooLarge { size: len, max };
                return Err(DisconnectReason::from_error(&err));
            }

            let mut body = BytesMut::zeroed(len);
            let read = tokio::select! {
                biased;
                _ = close.cancelled() => return Ok(()),
                r = self.reader.read_exact(&mut body) => r,
            };
            if let Err(e) = read {
                return Err(DisconnectReason::from_error(&Error::Io(e)));
            }
            trace!("received {:?} ({} bytes)", header.packet_type, len);

            // stop waits for the dispatch in hand, close does not
            let outcome = tokio::select! {
                biased;
                _ = close.cancelled() => return Ok(()),
                r = self.chain.dispatch(&self.ctx, &header, body.freeze()) => r,
            };
            match outcome {
                Ok(Outcome::Handled) | Ok(Outcome::Next) => {}
                Ok(Outcome::Close(reason)) => return Err(reason),
                Err(e) => {
                    debug!("dispatch of {:?} failed: {}", header.packet_type, e);
                    return Err(DisconnectReason::from_error(&e));
                }
            }
        }
    }
}
