use super::super::codec::Codec;
use super::super::error::{Error, Result};
use super::super::frame::{
    builder::build_setup, comm::PDU_REF_OFFSET, parse_param, ParamRef, S7AppBody, S7Message,
};
use super::state::{Negotiated, SessionConfig, PDU_SIZE_CEILING};
use super::Duplex;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// COTP CR/CC exchange on a freshly connected transport.
pub(super) async fn iso_connect(
    framed: &mut Framed<Box<dyn Duplex>, Codec>,
    config: &SessionConfig,
) -> Result<()> {
    let cr = S7Message::connection_request(config.src_tsap, config.dst_tsap);
    timeout(config.timeout, framed.send(cr))
        .await
        .map_err(|_| Error::Timeout)??;

    let msg = timeout(config.timeout, framed.next())
        .await
        .map_err(|_| Error::Timeout)?
        .ok_or(Error::unexpected("transport closed during COTP handshake"))??;
    match msg.cotp {
        super::super::frame::Cotp::Cc(_) => Ok(()),
        _ => Err(Error::unexpected("expected COTP connection confirm")),
    }
}

/// Setup Communication exchange; returns the negotiated PDU size and window.
pub(super) async fn negotiate(
    framed: &mut Framed<Box<dyn Duplex>, Codec>,
    config: &SessionConfig,
) -> Result<Negotiated> {
    let mut frame = build_setup(config.max_jobs, config.max_jobs, config.max_pdu_size);
    // The handshake runs before the IO driver; reference 1 is safe and the
    // driver's allocator only needs uniqueness among outstanding jobs.
    frame[PDU_REF_OFFSET..PDU_REF_OFFSET + 2].copy_from_slice(&1u16.to_be_bytes());
    timeout(config.timeout, framed.send(S7Message::data(frame.freeze())))
        .await
        .map_err(|_| Error::Timeout)??;

    let msg = timeout(config.timeout, framed.next())
        .await
        .map_err(|_| Error::Timeout)?
        .ok_or(Error::unexpected("transport closed during setup"))??;
    let pdu = match msg.app {
        Some(S7AppBody::Parsed(pdu)) => pdu,
        _ => return Err(Error::unexpected("expected setup AckData")),
    };
    pdu.check_error()?;

    match parse_param(pdu.header.pdu_type, &pdu.param)? {
        ParamRef::AckSetup(setup) => {
            let pdu_size = config
                .max_pdu_size
                .min(setup.pdu_len)
                .min(PDU_SIZE_CEILING);
            if pdu_size < 64 {
                return Err(Error::unexpected("negotiated PDU size unusably small"));
            }
            let amq = setup.amq_callee.max(1) as usize;
            Ok(Negotiated {
                pdu_size,
                max_jobs: amq.min(config.max_jobs.max(1) as usize),
            })
        }
        _ => Err(Error::unexpected("expected setup parameters")),
    }
}
