use async_recursion::async_recursion;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::Instrument;

use dns_types::protocol::types::*;

use crate::upstream::{Upstream, UpstreamError};
use crate::RECURSION_LIMIT;

/// Recursive DNS resolution, by following referrals down from a root
/// nameserver.
///
/// Every nameserver is assumed to listen on the same port as the
/// root.
#[derive(Debug, Clone)]
pub struct Resolver<U> {
    upstream: U,
    root_address: Ipv4Addr,
    port: u16,
}

impl<U: Upstream> Resolver<U> {
    pub fn new(upstream: U, root_address: Ipv4Addr, port: u16) -> Self {
        Self {
            upstream,
            root_address,
            port,
        }
    }

    /// Resolve a query, starting from the root nameserver.
    ///
    /// # Errors
    ///
    /// See `ResolutionError`.
    pub async fn resolve(&self, query: &Message) -> Result<Message, ResolutionError> {
        self.resolve_from(query, self.root_address).await
    }

    /// Resolve a query, starting from the given nameserver.
    ///
    /// The nameserver is asked the query.  If it gives an answer,
    /// that reply is returned.  If it gives a referral, each of the
    /// nameservers it names is tried in turn, and the first to lead
    /// to an answer wins.
    ///
    /// # Errors
    ///
    /// See `ResolutionError`.
    pub async fn resolve_from(
        &self,
        query: &Message,
        address: Ipv4Addr,
    ) -> Result<Message, ResolutionError> {
        let span = match query.questions.first() {
            Some(question) => tracing::error_span!("resolve", %question),
            None => tracing::error_span!("resolve"),
        };

        self.resolve_recursive(RECURSION_LIMIT, query, address)
            .instrument(span)
            .await
    }

    #[async_recursion]
    async fn resolve_recursive(
        &self,
        recursion_limit: usize,
        query: &Message,
        address: Ipv4Addr,
    ) -> Result<Message, ResolutionError> {
        if recursion_limit == 0 {
            tracing::debug!("hit recursion limit");
            return Err(ResolutionError::RecursionLimit);
        }

        let response = self
            .upstream
            .query(SocketAddr::from((address, self.port)), query)
            .instrument(tracing::error_span!("query_nameserver", %address))
            .await?;

        if !response.answers.is_empty() {
            tracing::trace!(%address, "got answer");
            return Ok(response);
        }

        for authority in &response.authority {
            let RecordTypeWithData::NS { nsdname } = &authority.rtype_with_data else {
                continue;
            };
            tracing::trace!(%nsdname, "got candidate nameserver");

            let nameserver_address = if let Some(glue) = glue_address(&response, nsdname) {
                glue
            } else {
                match self
                    .resolve_nameserver(recursion_limit - 1, query.header.id, nsdname)
                    .await
                {
                    Ok(ip) => ip,
                    Err(ResolutionError::RecursionLimit) => {
                        return Err(ResolutionError::RecursionLimit)
                    }
                    Err(error) => {
                        tracing::debug!(%nsdname, %error, "could not find nameserver address");
                        continue;
                    }
                }
            };

            match self
                .resolve_recursive(recursion_limit - 1, query, nameserver_address)
                .await
            {
                Ok(answer) => return Ok(answer),
                Err(ResolutionError::RecursionLimit) => return Err(ResolutionError::RecursionLimit),
                Err(error) => {
                    tracing::debug!(address = %nameserver_address, %error, "referral failed");
                }
            }
        }

        tracing::trace!(%address, "out of candidates");
        Err(ResolutionError::DeadEnd { address })
    }

    /// Find the address of a nameserver with a fresh A query, which
    /// starts again from the root.
    async fn resolve_nameserver(
        &self,
        recursion_limit: usize,
        id: u16,
        nsdname: &DomainName,
    ) -> Result<Ipv4Addr, ResolutionError> {
        let query = Message::from_question(
            id,
            Question {
                name: nsdname.clone(),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );

        let response = self
            .resolve_recursive(recursion_limit, &query, self.root_address)
            .instrument(tracing::error_span!("resolve_nameserver", %nsdname))
            .await?;

        response
            .answers
            .iter()
            .find_map(|rr| match rr.rtype_with_data {
                RecordTypeWithData::A { address } => Some(address),
                _ => None,
            })
            .ok_or(ResolutionError::DeadEnd {
                address: self.root_address,
            })
    }
}

/// An A record in the additional section naming the nameserver.
fn glue_address(response: &Message, nsdname: &DomainName) -> Option<Ipv4Addr> {
    response.additional.iter().find_map(|rr| match rr.rtype_with_data {
        RecordTypeWithData::A { address } if rr.name.eq_ignore_case(nsdname) => Some(address),
        _ => None,
    })
}

/// An error that can occur when trying to resolve a domain.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// Recursive resolution hit the recursion limit.
    #[error("hit recursion limit")]
    RecursionLimit,

    /// A nameserver neither answered nor gave a referral which led
    /// anywhere.
    #[error("no answer or usable referral from {address}")]
    DeadEnd { address: Ipv4Addr },

    /// A nameserver could not be asked, or its reply was unusable.
    #[error("upstream nameserver failed")]
    Upstream(#[from] UpstreamError),
}
