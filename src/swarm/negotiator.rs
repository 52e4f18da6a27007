use async_trait::async_trait;
use tracing::{debug, trace};

use super::{
    config::NegotiatorConfig,
    conn::Connection,
    wire::{read_message, write_message, MessageDecoder},
    Error::*,
    Result,
};

/// Introduces two peers by relaying session messages between them.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(
        &self,
        offerer: &mut dyn Connection,
        acceptor: &mut dyn Connection,
    ) -> Result<()>;
}

/// Relays offers and answers verbatim until the acceptor agrees, giving up
/// after a fixed number of roundtrips.
pub struct RoundtripNegotiator {
    config: NegotiatorConfig,
    decoder: MessageDecoder,
}

impl RoundtripNegotiator {
    pub fn new(config: NegotiatorConfig, decoder: MessageDecoder) -> Self {
        Self { config, decoder }
    }
}

#[async_trait]
impl Negotiator for RoundtripNegotiator {
    async fn negotiate(
        &self,
        offerer: &mut dyn Connection,
        acceptor: &mut dyn Connection,
    ) -> Result<()> {
        let max_len = self.config.max_message_len;
        for roundtrip in 1..=self.config.roundtrip_limit {
            let offer = read_message(&mut *offerer, max_len).await?;
            write_message(&mut *acceptor, &offer).await?;

            let response = read_message(&mut *acceptor, max_len).await?;
            // decoded only for the verdict, the offerer gets the raw bytes
            let accepted = (self.decoder)(&response)?.is_accepted();
            write_message(&mut *offerer, &response).await?;

            trace!(
                offerer = %offerer.address(),
                acceptor = %acceptor.address(),
                roundtrip,
                accepted,
                "relayed negotiation roundtrip"
            );
            if accepted {
                debug!(roundtrip, "negotiation accepted");
                return Ok(());
            }
        }
        Err(RoundtripLimitReached(self.config.roundtrip_limit))
    }
}
