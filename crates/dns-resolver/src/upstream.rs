use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use dns_types::protocol::deserialise;
use dns_types::protocol::serialise;
use dns_types::protocol::types::*;

/// Something which can put a question to a remote nameserver.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` to the nameserver at `address` and return its
    /// reply.  The reply has been checked to be a response to this
    /// request, but its contents are otherwise unvalidated.
    async fn query(&self, address: SocketAddr, request: &Message) -> Result<Message, UpstreamError>;
}

/// Queries nameservers over UDP, with one socket per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpUpstream {
    /// How long to wait for a reply.  Sending has no deadline.
    pub timeout: Duration,

    /// The largest reply which can be received.
    pub buffer_size: usize,
}

impl UdpUpstream {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            timeout: Duration::from_secs(5),
            buffer_size,
        }
    }
}

impl Default for UdpUpstream {
    fn default() -> Self {
        Self::new(512)
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query(&self, address: SocketAddr, request: &Message) -> Result<Message, UpstreamError> {
        let serialised_request = request.to_octets()?;

        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        sock.connect(address).await?;
        sock.send(&serialised_request).await?;

        let mut buf = vec![0u8; self.buffer_size];
        let size = timeout(self.timeout, sock.recv(&mut buf))
            .await
            .map_err(|_| UpstreamError::Timeout)??;

        let response = Message::from_octets(&buf[..size])?;
        if response_matches_request(request, &response) {
            Ok(response)
        } else {
            Err(UpstreamError::MismatchedResponse)
        }
    }
}

/// Very basic validation that a nameserver response matches a
/// request: the ID must be the same, and it must be flagged as a
/// response.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    request.header.id == response.header.id && response.header.is_response()
}

/// Errors that can arise when querying a nameserver.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("network error")]
    Io(#[from] io::Error),

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("could not parse reply")]
    Deserialise(#[from] deserialise::Error),

    #[error("could not serialise request")]
    Serialise(#[from] serialise::Error),

    #[error("reply does not match request")]
    MismatchedResponse,
}

#[cfg(any(feature = "test-util", test))]
#[allow(clippy::missing_panics_doc)]
pub mod test_util {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A reply which `ScriptedUpstream` will give to a query.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedReply {
        pub answers: Vec<ResourceRecord>,
        pub authority: Vec<ResourceRecord>,
        pub additional: Vec<ResourceRecord>,
    }

    /// An in-memory `Upstream` which answers queries from a fixed
    /// script, and records every query it gets.  Unscripted queries
    /// time out.
    ///
    /// Clones share the script and the query log.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedUpstream {
        inner: Arc<Mutex<ScriptedUpstreamInner>>,
    }

    #[derive(Debug, Default)]
    struct ScriptedUpstreamInner {
        replies: HashMap<(Ipv4Addr, DomainName, RecordType), ScriptedReply>,
        queries: Vec<(SocketAddr, Question)>,
    }

    impl ScriptedUpstream {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the reply the server at `address` gives to a
        /// question about `name`.
        pub fn reply(&self, address: Ipv4Addr, name: &str, rtype: RecordType, reply: ScriptedReply) {
            self.inner.lock().unwrap().replies.insert(
                (address, DomainName::from_dotted_string(name).unwrap(), rtype),
                reply,
            );
        }

        /// Every query made so far, in order.
        pub fn queries(&self) -> Vec<(SocketAddr, Question)> {
            self.inner.lock().unwrap().queries.clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn query(&self, address: SocketAddr, request: &Message) -> Result<Message, UpstreamError> {
            let question = request.questions[0].clone();
            let mut inner = self.inner.lock().unwrap();
            inner.queries.push((address, question.clone()));

            let SocketAddr::V4(address) = address else {
                return Err(UpstreamError::Timeout);
            };

            match inner
                .replies
                .get(&(*address.ip(), question.name, question.qtype))
            {
                Some(reply) => {
                    let mut response = Message::make_response(request, reply.answers.clone());
                    response.authority.clone_from(&reply.authority);
                    response.additional.clone_from(&reply.additional);
                    Ok(response)
                }
                None => Err(UpstreamError::Timeout),
            }
        }
    }
}
