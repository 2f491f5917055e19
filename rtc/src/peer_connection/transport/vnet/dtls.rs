use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use tokio::sync::Mutex as AsyncMutex;

use shared::Conn;
use shared::error::{Error, Result};

use crate::peer_connection::transport::dtls::engine::{DtlsHandshakeConfig, DtlsHandshakeResult};

/// Content types borrowed from the DTLS record layer so the frames land in
/// the RFC 7983 DTLS range of the mux.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;

const HELLO_INTERVAL: Duration = Duration::from_millis(50);
const MAX_RECORD_SIZE: usize = 270 * 1024;

fn hello(ack: bool, der: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(2 + der.len());
    b.put_u8(CONTENT_TYPE_HANDSHAKE);
    b.put_u8(ack as u8);
    b.put_slice(der);
    b.freeze()
}

/// handshake exchanges certificates with the peer. Each side repeats its
/// hello until it holds the peer certificate and has seen the peer
/// acknowledge its own.
pub(crate) async fn handshake(
    conn: Arc<dyn Conn>,
    config: DtlsHandshakeConfig,
) -> Result<DtlsHandshakeResult> {
    let der = config.certificate.der().to_vec();
    let mut peer_certificate: Option<Vec<u8>> = None;
    let mut peer_acked = false;
    let mut early_data = VecDeque::new();

    let mut buf = vec![0u8; MAX_RECORD_SIZE];
    let mut ticker = tokio::time::interval(HELLO_INTERVAL);

    while peer_certificate.is_none() || !peer_acked {
        tokio::select! {
            _ = ticker.tick() => {
                conn.send(&hello(peer_certificate.is_some(), &der)).await?;
            }
            res = conn.recv(&mut buf) => {
                let n = res?;
                match buf[..n].split_first() {
                    Some((&CONTENT_TYPE_HANDSHAKE, [ack, cert @ ..])) => {
                        if peer_certificate.is_none() {
                            peer_certificate = Some(cert.to_vec());
                            // acknowledge right away instead of waiting for the ticker
                            conn.send(&hello(true, &der)).await?;
                        }
                        peer_acked |= *ack == 1;
                    }
                    Some((&CONTENT_TYPE_APPLICATION_DATA, payload)) => {
                        early_data.push_back(Bytes::copy_from_slice(payload));
                    }
                    _ => {
                        return Err(Error::ErrDtlsHandshake(format!(
                            "unexpected record of {n} bytes"
                        )));
                    }
                }
            }
        }
    }

    // the peer may still be waiting for our acknowledgement
    conn.send(&hello(true, &der)).await?;
    trace!(
        "vnet dtls handshake done as {}",
        if config.is_client { "client" } else { "server" }
    );

    Ok(DtlsHandshakeResult {
        conn: Arc::new(DtlsConn {
            next_conn: conn,
            reader: AsyncMutex::new(DtlsReader { early_data, record: buf }),
        }),
        peer_certificates: peer_certificate.into_iter().collect(),
    })
}

/// Application data channel on top of the handshake. Late handshake
/// records are skipped.
struct DtlsConn {
    next_conn: Arc<dyn Conn>,
    reader: AsyncMutex<DtlsReader>,
}

struct DtlsReader {
    early_data: VecDeque<Bytes>,
    record: Vec<u8>,
}

#[async_trait]
impl Conn for DtlsConn {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        if let Some(payload) = reader.early_data.pop_front() {
            if payload.len() > buf.len() {
                return Err(Error::ErrBufferTooSmall);
            }
            buf[..payload.len()].copy_from_slice(&payload);
            return Ok(payload.len());
        }

        loop {
            let n = self.next_conn.recv(&mut reader.record).await?;
            if let Some((&CONTENT_TYPE_APPLICATION_DATA, payload)) = reader.record[..n].split_first() {
                if payload.len() > buf.len() {
                    return Err(Error::ErrBufferTooSmall);
                }
                buf[..payload.len()].copy_from_slice(payload);
                return Ok(payload.len());
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let mut record = BytesMut::with_capacity(1 + buf.len());
        record.put_u8(CONTENT_TYPE_APPLICATION_DATA);
        record.put_slice(buf);
        self.next_conn.send(&record).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.next_conn.close().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_connection::certificate::RTCCertificate;
    use crate::peer_connection::transport::vnet::conn::pipe;

    #[tokio::test]
    async fn test_handshake_exchanges_certificates() -> Result<()> {
        let (a, b) = pipe();
        let a_cert = RTCCertificate::generate()?;
        let b_cert = RTCCertificate::generate()?;

        let a_config = DtlsHandshakeConfig {
            is_client: true,
            certificate: a_cert.clone(),
        };
        let b_config = DtlsHandshakeConfig {
            is_client: false,
            certificate: b_cert.clone(),
        };

        let (a_result, b_result) = tokio::join!(
            handshake(Arc::new(a), a_config),
            handshake(Arc::new(b), b_config)
        );
        let (a_result, b_result) = (a_result?, b_result?);

        assert_eq!(vec![b_cert.der().to_vec()], a_result.peer_certificates);
        assert_eq!(vec![a_cert.der().to_vec()], b_result.peer_certificates);

        a_result.conn.send(b"ping").await?;
        let mut buf = [0u8; 16];
        let n = b_result.conn.recv(&mut buf).await?;
        assert_eq!(b"ping", &buf[..n]);

        Ok(())
    }
}
