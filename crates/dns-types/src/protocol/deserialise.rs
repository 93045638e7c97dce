//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        let mut questions = Vec::with_capacity(qdcount.into());
        let mut answers = Vec::with_capacity(ancount.into());
        let mut authority = Vec::with_capacity(nscount.into());
        let mut additional = Vec::with_capacity(arcount.into());

        for _ in 0..qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..nscount {
            authority.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..arcount {
            additional.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header: Header { id, flags },
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        let qclass = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;

        Ok(Self {
            name,
            qtype: RecordType::try_from(qtype)
                .map_err(|_| Error::UnknownRecordType { id, tag: qtype })?,
            qclass: RecordClass::try_from(qclass)
                .map_err(|_| Error::UnknownRecordClass { id, tag: qclass })?,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        let rclass = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rtype = RecordType::try_from(rtype)
            .map_err(|_| Error::UnknownRecordType { id, tag: rtype })?;
        let rclass = RecordClass::try_from(rclass)
            .map_err(|_| Error::UnknownRecordClass { id, tag: rclass })?;

        let rdata_start = buffer.position;

        // addresses are a fixed size, so a record claiming any other
        // length is malformed rather than short.
        let rtype_with_data = match rtype {
            RecordType::A => {
                if rdlength != 4 {
                    return Err(Error::ResourceRecordInvalid(id));
                }
                RecordTypeWithData::A {
                    address: Ipv4Addr::from(
                        buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                    ),
                }
            }
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::AAAA => {
                if rdlength != 16 {
                    return Err(Error::ResourceRecordInvalid(id));
                }
                let octets: [u8; 16] = buffer
                    .take(16)
                    .and_then(|os| os.try_into().ok())
                    .ok_or(Error::ResourceRecordTooShort(id))?;
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(octets),
                }
            }
        };

        let rdata_stop = buffer.position;

        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

impl DomainName {
    /// Read a name starting at the buffer's current position,
    /// following compression pointers.
    ///
    /// Afterwards the buffer is positioned just past the name as it
    /// appears at the starting position: if the name contains a
    /// pointer, that is two octets past the first pointer.
    ///
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut len = 0;
        let mut cursor = buffer.at_offset(buffer.position);
        let mut resume_at = None;
        let mut visited = HashSet::new();

        loop {
            let size = cursor.next_u8().ok_or(Error::DomainTooShort(id))?;

            if usize::from(size) <= LABEL_MAX_LEN {
                len += 1 + usize::from(size);
                if len > DOMAINNAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }

                if size == 0 {
                    labels.push(Label::new());
                    break;
                }

                let os = cursor
                    .take(size as usize)
                    .ok_or(Error::DomainTooShort(id))?;
                // the length has been bounds checked above
                let label = Label::try_from(os).map_err(|_| Error::DomainLabelInvalid(id))?;
                labels.push(label);
            } else if size >= 192 {
                let hi = size & 0b0011_1111;
                let lo = cursor.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                if resume_at.is_none() {
                    resume_at = Some(cursor.position);
                }

                if !visited.insert(ptr) {
                    return Err(Error::DomainPointerLoop(id));
                }

                cursor = cursor.at_offset(ptr);
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        buffer.position = resume_at.unwrap_or(cursor.position);
        Ok(DomainName { labels, len })
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have an `id` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error cannot even be sent back to the
    /// client in this case as, without an ID, it cannot be linked
    /// with the correct query.
    #[error("datagram is too short to contain an id")]
    CompletelyBusted,

    /// The header is missing one or more required fields.
    #[error("header is too short")]
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    #[error("question is too short")]
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    #[error("resource record is too short")]
    ResourceRecordTooShort(u16),

    /// A resource record is the wrong format.
    #[error("resource record is invalid")]
    ResourceRecordInvalid(u16),

    /// A question or resource record has a type this application
    /// does not handle.
    #[error("unsupported record type {tag}")]
    UnknownRecordType { id: u16, tag: u16 },

    /// A question or resource record has a class this application
    /// does not handle.
    #[error("unsupported record class {tag}")]
    UnknownRecordClass { id: u16, tag: u16 },

    /// A domain is incomplete.
    #[error("domain name is too short")]
    DomainTooShort(u16),

    /// A domain is over 255 octets in size.
    #[error("domain name is too long")]
    DomainTooLong(u16),

    /// A domain label is longer than 63 octets, but not a pointer.
    #[error("domain label is invalid")]
    DomainLabelInvalid(u16),

    /// A chain of compression pointers visits the same offset twice.
    #[error("domain name pointers form a loop")]
    DomainPointerLoop(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::UnknownRecordType { id, .. }
            | Error::UnknownRecordClass { id, .. }
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainLabelInvalid(id)
            | Error::DomainPointerLoop(id) => Some(id),
        }
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}
