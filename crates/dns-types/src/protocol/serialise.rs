//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.
//!
//! Names are always written out in full: no compression pointers are
//! emitted.

use bytes::{BufMut, BytesMut};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.id);
        buffer.write_u16(self.flags);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        for label in &self.labels {
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Error {
    /// A counter does not fit in the desired width.
    #[error("'{counter}' cannot be converted to a u{bits}")]
    CounterTooLarge { counter: usize, bits: u32 },
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_names_are_not_compressed() {
        let mut buf = WritableBuffer::default();
        domain("www.example.com.").serialise(&mut buf);
        domain("www.example.com.").serialise(&mut buf);

        assert_eq!(
            vec![
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_root_domain() {
        let mut buf = WritableBuffer::default();
        DomainName::root_domain().serialise(&mut buf);

        assert_eq!(vec![0], buf.octets);
    }

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let _ = ns_record("example.com.", "ns.example.com.").serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_0010, // NS
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0000, // 16 octets
                // RDATA
                2, 110, 115, // "ns"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_a_query_response() {
        let request = Message::from_question(
            0x1234,
            Question {
                name: domain("a.io."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );
        let response = Message::make_response(
            &request,
            vec![a_record("a.io.", Ipv4Addr::new(1, 2, 3, 4))],
        );

        assert_eq!(
            vec![
                // HEADER
                0x12, 0x34, // id
                0b1000_0000, 0b1000_0000, // QR, RA
                0, 1, 0, 1, 0, 0, 0, 0, // counts
                // QUESTION
                1, 97, 2, 105, 111, 0, // "a.io"
                0, 1, // A
                0, 1, // IN
                // ANSWER
                1, 97, 2, 105, 111, 0, // "a.io"
                0, 1, // A
                0, 1, // IN
                0, 0, 1, 44, // 300
                0, 4, // RDLENGTH
                1, 2, 3, 4, // RDATA
            ],
            response.to_octets().unwrap().to_vec(),
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_aaaa_rdata() {
        let mut buf = WritableBuffer::default();
        let _ = aaaa_record(".", Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)).serialise(&mut buf);

        assert_eq!(
            vec![
                0, // root
                0, 28, // AAAA
                0, 1, // IN
                0, 0, 1, 44, // 300
                0, 16, // RDLENGTH
                0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_unsupported_response_header() {
        let octets = Message::make_unsupported_response(7).to_octets().unwrap();

        assert_eq!(
            vec![0, 7, 0b1000_0000, 0b1000_0100, 0, 0, 0, 0, 0, 0, 0, 0],
            octets.to_vec()
        );
    }
}
