//! Client-side transport: TCP, TLS and STARTTLS connection setup, plus the
//! pump task that shuttles messages between the socket and its queues.

use std::{io, net::ToSocketAddrs, time::Duration};

use futures::{
    channel::mpsc::{self, Receiver, Sender},
    SinkExt, StreamExt,
};
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_native_tls::TlsStream;
use tokio_util::codec::Framed;

use crate::{
    codec::LdapCodec,
    oid,
    options::{TlsKind, TlsOptions},
    proto::{ExtendedRequest, LdapMessage, ProtocolOp, ResultCode},
};

const CHANNEL_SIZE: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// STARTTLS is negotiated before the id allocator hands anything out;
/// message id 1 belongs to it.
const STARTTLS_MESSAGE_ID: i32 = 1;

pub type LdapMessageSender = Sender<LdapMessage>;
pub type LdapMessageReceiver = Receiver<LdapMessage>;

/// LDAP channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("connection attempt timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("server rejected STARTTLS")]
    StartTlsRejected,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Connector for the client side of an LDAP session.
pub struct LdapChannel {
    address: String,
    port: u16,
}

impl LdapChannel {
    pub fn for_client<S>(address: S, port: u16) -> Self
    where
        S: AsRef<str>,
    {
        LdapChannel {
            address: address.as_ref().to_owned(),
            port,
        }
    }

    /// Establish the transport requested by `options` and hand back the
    /// queue endpoints the connection layer talks through.
    pub async fn connect(self, options: TlsOptions) -> ChannelResult<(LdapMessageSender, LdapMessageReceiver)> {
        let stream = self.open_tcp().await?;
        match options.kind {
            TlsKind::Plain => Ok(self.spawn_pump(stream)),
            TlsKind::Tls => {
                let stream = self.handshake(options, stream).await?;
                Ok(self.spawn_pump(stream))
            }
            TlsKind::StartTls => {
                let stream = self.negotiate_start_tls(options, stream).await?;
                Ok(self.spawn_pump(stream))
            }
        }
    }

    /// Try every resolved address until one accepts, each under the
    /// connect timeout.
    async fn open_tcp(&self) -> ChannelResult<TcpStream> {
        let mut last_error = None;
        for addr in (self.address.as_str(), self.port).to_socket_addrs()? {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await? {
                Ok(stream) => {
                    debug!("Connected to {}", addr);
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))
            .into())
    }

    /// RFC 4511 STARTTLS: one extended request on the still-plain socket,
    /// then a TLS handshake over the same stream once the server agrees.
    /// Nothing else is in flight while this runs.
    async fn negotiate_start_tls<S>(&self, options: TlsOptions, mut stream: S) -> ChannelResult<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let reply = {
            let mut framed = Framed::new(&mut stream, LdapCodec::default());
            let request = ExtendedRequest {
                name: oid::STARTTLS_OID.to_owned(),
                value: None,
            };
            framed
                .send(LdapMessage::new(STARTTLS_MESSAGE_ID, ProtocolOp::ExtendedRequest(request)))
                .await
                .map_err(|_| ChannelError::StartTlsRejected)?;
            framed.next().await
        };

        let accepted = matches!(
            reply,
            Some(Ok(LdapMessage {
                message_id: STARTTLS_MESSAGE_ID,
                protocol_op: ProtocolOp::ExtendedResponse(ref resp),
                ..
            })) if resp.result.result_code == ResultCode::Success
        );
        if !accepted {
            debug!("STARTTLS refused by {}", self.address);
            return Err(ChannelError::StartTlsRejected);
        }
        self.handshake(options, stream).await
    }

    async fn handshake<S>(&self, options: TlsOptions, stream: S) -> ChannelResult<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connector = match options.connector {
            Some(connector) => connector,
            None => {
                let mut builder = native_tls::TlsConnector::builder();
                builder.danger_accept_invalid_certs(options.accept_invalid_certs);
                builder.danger_accept_invalid_hostnames(options.accept_invalid_hostnames);
                builder.build()?
            }
        };
        let sni = options.domain_name.as_deref().unwrap_or(&self.address);
        debug!("TLS handshake with {} (SNI {})", self.address, sni);
        let stream = tokio_native_tls::TlsConnector::from(connector).connect(sni, stream).await?;
        Ok(stream)
    }

    /// Callers talk to the socket through two bounded queues; one task owns
    /// the framed stream. When either queue or the peer goes away the task
    /// finishes, which drops the socket and closes the other queue too.
    fn spawn_pump<S>(&self, stream: S) -> (LdapMessageSender, LdapMessageReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_SIZE);
        tokio::spawn(pump(Framed::new(stream, LdapCodec::default()), outbound_rx, inbound_tx));
        (outbound_tx, inbound_rx)
    }
}

async fn pump<S>(framed: Framed<S, LdapCodec>, mut outbound: Receiver<LdapMessage>, mut inbound: Sender<LdapMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut wire_out, mut wire_in) = framed.split();
    loop {
        tokio::select! {
            queued = outbound.next() => {
                let Some(msg) = queued else { break };
                if wire_out.send(msg).await.is_err() {
                    break;
                }
            }
            received = wire_in.next() => {
                match received {
                    Some(Ok(msg)) => {
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Dropping connection: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Channel pump finished");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::proto::LdapResult;

    /// Loopback server answering every request with a DelResponse carrying
    /// the request's message id.
    async fn answering_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, LdapCodec::default());
            while let Some(Ok(msg)) = framed.next().await {
                let reply = LdapMessage::new(
                    msg.message_id,
                    ProtocolOp::DelResponse(LdapResult::new(ResultCode::Success, "", "")),
                );
                if framed.send(reply).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_messages_roundtrip_in_order() {
        let addr = answering_server().await;
        let (mut sender, mut receiver) = LdapChannel::for_client("127.0.0.1", addr.port())
            .connect(TlsOptions::plain())
            .await
            .unwrap();

        for id in 1..=3 {
            sender
                .send(LdapMessage::new(id, ProtocolOp::DelRequest("cn=gone,o=x".into())))
                .await
                .unwrap();
        }
        for id in 1..=3 {
            let reply = receiver.next().await.unwrap();
            assert_eq!(reply.message_id, id);
            assert!(matches!(reply.protocol_op, ProtocolOp::DelResponse(_)));
        }
    }

    #[tokio::test]
    async fn test_receiver_ends_when_sender_closed() {
        let addr = answering_server().await;
        let (mut sender, mut receiver) = LdapChannel::for_client("127.0.0.1", addr.port())
            .connect(TlsOptions::plain())
            .await
            .unwrap();

        sender.close_channel();
        assert!(receiver.next().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // bind and drop to obtain a port nobody is listening on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = LdapChannel::for_client("127.0.0.1", port)
            .connect(TlsOptions::plain())
            .await;
        assert!(result.is_err());
    }
}
