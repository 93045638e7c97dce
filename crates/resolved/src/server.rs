use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::Instrument;

use dns_resolver::cache::SharedCache;
use dns_resolver::recursive::{ResolutionError, Resolver};
use dns_resolver::upstream::Upstream;
use dns_types::protocol::types::*;

use crate::settings::Settings;

/// A caching nameserver on one UDP socket.  Requests are handled one
/// at a time, in the order they arrive.
pub struct Server<U> {
    socket: UdpSocket,
    resolver: Resolver<U>,
    cache: SharedCache,
    request_size: usize,
}

impl<U: Upstream> Server<U> {
    /// # Errors
    ///
    /// If the socket cannot be bound.
    pub async fn bind(
        settings: &Settings,
        resolver: Resolver<U>,
        cache: SharedCache,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind((settings.server_ip, settings.server_port)).await?;

        Ok(Self {
            socket,
            resolver,
            cache,
            request_size: settings.request_size,
        })
    }

    /// # Errors
    ///
    /// If the socket address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until `shutdown` completes.  The socket is
    /// closed on return.
    pub async fn run<F: Future<Output = ()>>(self, shutdown: F) {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; self.request_size];

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutting down");
                    return;
                }

                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((size, peer)) => {
                        let response = self
                            .handle_request(&buf[..size])
                            .instrument(tracing::error_span!("request", %peer))
                            .await;

                        if let Some(message) = response {
                            self.send_response(&message, peer).await;
                        }
                    }
                    Err(error) => tracing::warn!(?error, "udp receive error"),
                }
            }
        }
    }

    /// Work out the response to a datagram.  There is no response if
    /// the datagram is too short to have an ID.
    pub async fn handle_request(&self, octets: &[u8]) -> Option<Message> {
        match Message::from_octets(octets) {
            Ok(request) => match self.answer(&request).await {
                Ok(answers) => Some(Message::make_response(&request, answers)),
                Err(error) => {
                    tracing::warn!(%error, "could not resolve request");
                    Some(Message::make_unsupported_response(request.header.id))
                }
            },
            Err(error) => {
                tracing::debug!(%error, "could not parse request");
                error.id().map(Message::make_unsupported_response)
            }
        }
    }

    /// Answer every question from the cache, or failing that by
    /// resolving it and caching the answer.  The first failure
    /// abandons the whole request.
    async fn answer(&self, request: &Message) -> Result<Vec<ResourceRecord>, ResolutionError> {
        let mut answers = Vec::new();

        for question in &request.questions {
            if let Some(entry) = self.cache.get(&question.name, question.qtype) {
                tracing::trace!(%question, "cache hit");
                answers.extend(entry.records);
                continue;
            }

            tracing::trace!(%question, "cache miss");
            let query = Message::from_question(request.header.id, question.clone());
            let response = self.resolver.resolve(&query).await?;
            self.cache
                .add(&question.name, question.qtype, response.answers.clone());
            answers.extend(response.answers);
        }

        Ok(answers)
    }

    async fn send_response(&self, message: &Message, peer: SocketAddr) {
        match message.to_octets() {
            Ok(serialised) => {
                if let Err(error) = self.socket.send_to(&serialised, peer).await {
                    tracing::warn!(%peer, ?error, "udp send error");
                }
            }
            Err(error) => {
                tracing::error!(?message, %error, "could not serialise message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_resolver::upstream::test_util::*;
    use dns_types::protocol::types::test_util::*;

    use super::*;

    const ROOT: Ipv4Addr = Ipv4Addr::new(198, 41, 0, 4);

    async fn server(upstream: &ScriptedUpstream) -> Server<ScriptedUpstream> {
        let settings = Settings {
            server_port: 0,
            ..Settings::default()
        };
        Server::bind(
            &settings,
            Resolver::new(upstream.clone(), ROOT, 53),
            SharedCache::new(),
        )
        .await
        .unwrap()
    }

    fn question(name: &str, qtype: RecordType) -> Question {
        Question {
            name: domain(name),
            qtype,
            qclass: RecordClass::IN,
        }
    }

    fn request(id: u16, questions: Vec<Question>) -> Vec<u8> {
        let mut message = Message::from_question(id, questions[0].clone());
        message.header.flags |= HEADER_MASK_RD;
        message.questions = questions;
        message.to_octets().unwrap().to_vec()
    }

    #[tokio::test]
    async fn too_short_for_id_gets_no_response() {
        let upstream = ScriptedUpstream::new();
        let server = server(&upstream).await;

        assert_eq!(None, server.handle_request(&[1]).await);
    }

    #[tokio::test]
    async fn malformed_request_gets_unsupported_response() {
        let upstream = ScriptedUpstream::new();
        let server = server(&upstream).await;

        assert_eq!(
            Some(Message::make_unsupported_response(0x0102)),
            server.handle_request(&[1, 2, 0, 0, 0, 1]).await
        );
    }

    #[tokio::test]
    async fn unsupported_type_gets_unsupported_response() {
        let upstream = ScriptedUpstream::new();
        let server = server(&upstream).await;
        #[rustfmt::skip]
        let octets = [
            0, 9, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0,
            1, 97, 0,
            0, 15, // MX
            0, 1,
        ];

        assert_eq!(
            Some(Message::make_unsupported_response(9)),
            server.handle_request(&octets).await
        );
        assert!(upstream.queries().is_empty());
    }

    #[tokio::test]
    async fn answers_and_caches() {
        let upstream = ScriptedUpstream::new();
        let answer = a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1));
        upstream.reply(
            ROOT,
            "www.example.com",
            RecordType::A,
            ScriptedReply {
                answers: vec![answer.clone()],
                ..Default::default()
            },
        );
        let server = server(&upstream).await;

        let response = server
            .handle_request(&request(1, vec![question("www.example.com", RecordType::A)]))
            .await
            .unwrap();

        assert_eq!(1, response.header.id);
        assert!(response.header.is_response());
        assert!(response.header.recursion_desired());
        assert_eq!(vec![answer.clone()], response.answers);
        assert_eq!(
            Some(vec![answer]),
            server
                .cache
                .get(&domain("www.example.com"), RecordType::A)
                .map(|e| e.records)
        );
        assert_eq!(1, upstream.queries().len());
        assert_eq!(SocketAddr::from((ROOT, 53)), upstream.queries()[0].0);
    }

    #[tokio::test]
    async fn concatenates_answers_in_question_order() {
        let upstream = ScriptedUpstream::new();
        let a = a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1));
        let ptr = ptr_record("1.1.1.1.in-addr.arpa", "www.example.com");
        upstream.reply(
            ROOT,
            "1.1.1.1.in-addr.arpa",
            RecordType::PTR,
            ScriptedReply {
                answers: vec![ptr.clone()],
                ..Default::default()
            },
        );
        let server = server(&upstream).await;
        server
            .cache
            .add(&domain("www.example.com"), RecordType::A, vec![a.clone()]);

        let response = server
            .handle_request(&request(
                2,
                vec![
                    question("www.example.com", RecordType::A),
                    question("1.1.1.1.in-addr.arpa", RecordType::PTR),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(vec![a, ptr], response.answers);
        assert_eq!(2, response.questions.len());
        assert_eq!(1, upstream.queries().len());
    }

    #[tokio::test]
    async fn one_failed_question_fails_request() {
        let upstream = ScriptedUpstream::new();
        upstream.reply(
            ROOT,
            "www.example.com",
            RecordType::A,
            ScriptedReply {
                answers: vec![a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))],
                ..Default::default()
            },
        );
        let server = server(&upstream).await;

        let response = server
            .handle_request(&request(
                3,
                vec![
                    question("www.example.com", RecordType::A),
                    question("missing.example.com", RecordType::A),
                ],
            ))
            .await;

        assert_eq!(Some(Message::make_unsupported_response(3)), response);
    }
}
