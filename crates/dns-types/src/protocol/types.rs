use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Maximum encoded length of a domain name.  The number of labels
/// plus sum of the lengths of the labels.
pub const DOMAINNAME_MAX_LEN: usize = 255;

/// Maximum length of a single label in a domain name.
pub const LABEL_MAX_LEN: usize = 63;

/// Length of the fixed header at the start of every message.
pub const HEADER_LEN: usize = 12;

/// Mask for the QR flag being set (response).
pub const HEADER_MASK_QR: u16 = 0b1000_0000_0000_0000;

/// Mask for the opcode field.
pub const HEADER_MASK_OPCODE: u16 = 0b0111_1000_0000_0000;

/// Mask for the AA flag being set (authoritative)
pub const HEADER_MASK_AA: u16 = 0b0000_0100_0000_0000;

/// Mask for the TC flag being set (truncated)
pub const HEADER_MASK_TC: u16 = 0b0000_0010_0000_0000;

/// Mask for the RD flag being set (desired)
pub const HEADER_MASK_RD: u16 = 0b0000_0001_0000_0000;

/// Mask for the RA flag being set (available)
pub const HEADER_MASK_RA: u16 = 0b0000_0000_1000_0000;

/// Mask for the reserved Z field.
pub const HEADER_MASK_Z: u16 = 0b0000_0000_0111_0000;

/// Mask for the rcode field.
pub const HEADER_MASK_RCODE: u16 = 0b0000_0000_0000_1111;

/// Basic DNS message format, used for both queries and responses.
///
/// ```text
///     +---------------------+
///     |        Header       |
///     +---------------------+
///     |       Question      | the question for the name server
///     +---------------------+
///     |        Answer       | RRs answering the question
///     +---------------------+
///     |      Authority      | RRs pointing toward an authority
///     +---------------------+
///     |      Additional     | RRs holding additional information
///     +---------------------+
/// ```
///
/// See section 4.1 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// A single-question query, as sent to an upstream nameserver.
    pub fn from_question(id: u16, question: Question) -> Self {
        Self {
            header: Header { id, flags: 0 },
            questions: vec![question],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// A successful response to `request`, echoing its id and
    /// questions and carrying the given answers.  The authority and
    /// additional sections are left empty.
    pub fn make_response(request: &Self, answers: Vec<ResourceRecord>) -> Self {
        Self {
            header: Header {
                id: request.header.id,
                flags: HEADER_MASK_QR
                    | (request.header.flags & (HEADER_MASK_OPCODE | HEADER_MASK_RD))
                    | HEADER_MASK_RA,
            },
            questions: request.questions.clone(),
            answers,
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// The response sent when a request cannot be processed at all.
    /// Only the id is echoed.
    pub fn make_unsupported_response(id: u16) -> Self {
        Self {
            header: Header {
                id,
                flags: HEADER_MASK_QR | HEADER_MASK_RA | u16::from(u8::from(Rcode::NotImplemented)),
            },
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }
}

/// Common header type for all messages.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.1 of RFC 1035.
///
/// The flags are kept as the raw 16 bit field: nothing in this
/// application needs more than a few of them, and keeping the field
/// whole means unknown bits survive a decode / encode cycle.
///
/// The QDCOUNT, ANCOUNT, NSCOUNT, and ARCOUNT fields are omitted from
/// this type, as they are only used during serialisation and
/// deserialisation and can be inferred from the other `Message`
/// fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates any
    /// kind of query.  This identifier is copied the corresponding
    /// reply and can be used by the requester to match up replies to
    /// outstanding queries.
    pub id: u16,

    /// QR, Opcode, AA, TC, RD, RA, Z, and RCODE, as they appear on
    /// the wire.
    pub flags: u16,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.flags & HEADER_MASK_QR != 0
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & HEADER_MASK_RD != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & HEADER_MASK_TC != 0
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn rcode(&self) -> Rcode {
        // masked to 4 bits, so the cast is lossless
        Rcode::from((self.flags & HEADER_MASK_RCODE) as u8)
    }
}

/// The question section has a list of questions (usually 1 but
/// possibly more) being asked.  This is the structure for a single
/// question.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                     QNAME                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QTYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QCLASS                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.2 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Question {
    pub name: DomainName,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

/// The answer, authority, and additional sections are all the same
/// format: a variable number of resource records.  This is the
/// structure for a single resource record.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                                               /
///     /                      NAME                     /
///     |                                               |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      TYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     CLASS                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      TTL                      |
///     |                                               |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                   RDLENGTH                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
///     /                     RDATA                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.3 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct ResourceRecord {
    /// a domain name to which this resource record pertains.
    pub name: DomainName,

    /// A combination of the RTYPE and RDATA fields
    pub rtype_with_data: RecordTypeWithData,

    /// two octets which specify the class of the data in the RDATA
    /// field.
    pub rclass: RecordClass,

    /// a 32 bit unsigned integer that specifies the time interval (in
    /// seconds) that the resource record may be cached before it
    /// should be discarded.  Zero values are interpreted to mean that
    /// the RR can only be used for the transaction in progress, and
    /// should not be cached.
    pub ttl: u32,
}

/// A record type with its associated, deserialised, data.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum RecordTypeWithData {
    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                    ADDRESS                    |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `ADDRESS` is a 32 bit Internet address.
    A { address: Ipv4Addr },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                   NSDNAME                     /
    ///     /                                               /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `NSDNAME` is a domain name which specifies a host which
    /// should be authoritative for the specified class and domain.
    NS { nsdname: DomainName },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                   PTRDNAME                    /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `PTRDNAME` is a domain name which points to some
    /// location in the domain name space.
    PTR { ptrdname: DomainName },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                    ADDRESS                    |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `ADDRESS` is a 128 bit Internet address.
    AAAA { address: Ipv6Addr },
}

impl RecordTypeWithData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordTypeWithData::A { .. } => RecordType::A,
            RecordTypeWithData::NS { .. } => RecordType::NS,
            RecordTypeWithData::PTR { .. } => RecordType::PTR,
            RecordTypeWithData::AAAA { .. } => RecordType::AAAA,
        }
    }
}

/// The textual form of the RDATA: dotted octets for `A`, eight
/// unpadded lowercase hex groups for `AAAA` (no `::` shortening), and
/// the dotted name for `NS` and `PTR`.
impl fmt::Display for RecordTypeWithData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordTypeWithData::A { address } => write!(f, "{address}"),
            RecordTypeWithData::NS { nsdname } => write!(f, "{nsdname}"),
            RecordTypeWithData::PTR { ptrdname } => write!(f, "{ptrdname}"),
            RecordTypeWithData::AAAA { address } => {
                let mut first = true;
                for group in address.segments() {
                    if first {
                        first = false;
                    } else {
                        write!(f, ":")?;
                    }
                    write!(f, "{group:x}")?;
                }
                Ok(())
            }
        }
    }
}

/// What sort of response this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rcode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Reserved(RcodeReserved),
}

/// A struct with a private constructor, to ensure invalid `Rcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RcodeReserved(u8);

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "no-error"),
            Rcode::FormatError => write!(f, "format-error"),
            Rcode::ServerFailure => write!(f, "server-failure"),
            Rcode::NameError => write!(f, "name-error"),
            Rcode::NotImplemented => write!(f, "not-implemented"),
            Rcode::Refused => write!(f, "refused"),
            Rcode::Reserved(_) => write!(f, "reserved"),
        }
    }
}

impl From<u8> for Rcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Rcode::NoError,
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            other => Rcode::Reserved(RcodeReserved(other)),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::Reserved(RcodeReserved(octet)) => octet,
        }
    }
}

/// A domain name is a sequence of labels, where each label is a
/// length octet followed by that number of octets.  The final label
/// is always the empty root label.
///
/// A label must be 63 octets or shorter.  A name must be 255 octets
/// or shorter in total, including both length and label octets.
///
/// Labels keep the case they were received in, so two names which
/// differ only in case are different names.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Label>", into = "Vec<Label>")]
pub struct DomainName {
    pub labels: Vec<Label>,
    // INVARIANT: len == len(labels) + sum(map(len, labels))
    pub len: usize,
}

impl DomainName {
    pub fn root_domain() -> Self {
        DomainName {
            labels: vec![Label::new()],
            len: 1,
        }
    }

    pub fn is_root(&self) -> bool {
        self.len == 1 && self.labels[0].is_empty()
    }

    /// Compare two names as case-insensitive ASCII.
    pub fn eq_ignore_case(&self, other: &DomainName) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.octets.eq_ignore_ascii_case(&b.octets))
    }

    /// Render the labels joined by `.`, without a trailing dot.  Each
    /// octet is mapped to the character with the same code point.
    pub fn to_dotted_string(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }

        let mut out = String::with_capacity(self.len);
        let mut first = true;
        for label in &self.labels {
            if label.is_empty() {
                break;
            }
            if first {
                first = false;
            } else {
                out.push('.');
            }
            for octet in &label.octets {
                out.push(*octet as char);
            }
        }

        out
    }

    /// Parse a dotted string.  The trailing dot is optional.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s == "." || s.is_empty() {
            return Some(Self::root_domain());
        }

        let s = s.strip_suffix('.').unwrap_or(s);
        let mut labels = Vec::new();

        for label_chars in s.split('.') {
            if label_chars.is_empty() {
                return None;
            }

            let mut octets = Vec::with_capacity(label_chars.len());
            for c in label_chars.chars() {
                octets.push(u8::try_from(u32::from(c)).ok()?);
            }

            match Label::try_from(octets.as_slice()) {
                Ok(label) => labels.push(label),
                Err(_) => return None,
            }
        }

        labels.push(Label::new());
        Self::from_labels(labels)
    }

    pub fn from_labels(labels: Vec<Label>) -> Option<Self> {
        if labels.is_empty() {
            return None;
        }

        let mut len = labels.len();
        let mut blank_label = false;

        for label in &labels {
            if blank_label {
                return None;
            }

            blank_label |= label.is_empty();
            len += label.len() as usize;
        }

        if blank_label && len <= DOMAINNAME_MAX_LEN {
            Some(Self { labels, len })
        } else {
            None
        }
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainName")
            .field("to_dotted_string()", &self.to_dotted_string())
            .finish()
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.to_dotted_string())
    }
}

impl FromStr for DomainName {
    type Err = DomainNameFromStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DomainName::from_dotted_string(s).ok_or(DomainNameFromStr::NoParse)
    }
}

impl TryFrom<Vec<Label>> for DomainName {
    type Error = DomainNameFromStr;

    fn try_from(labels: Vec<Label>) -> Result<Self, Self::Error> {
        DomainName::from_labels(labels).ok_or(DomainNameFromStr::NoParse)
    }
}

impl From<DomainName> for Vec<Label> {
    fn from(name: DomainName) -> Self {
        name.labels
    }
}

/// Errors that can arise when converting a `&str` into a `DomainName`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum DomainNameFromStr {
    #[error("could not parse string to domain name")]
    NoParse,
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for DomainName {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_labels = u.int_in_range::<usize>(0..=10)?;
        let mut labels = Vec::new();
        for _ in 0..num_labels {
            labels.push(u.arbitrary()?);
        }
        labels.push(Label::new());
        Ok(DomainName::from_labels(labels).unwrap())
    }
}

/// A label is just a sequence of octets.  A label can be no longer
/// than 63 octets.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Label {
    /// Private to this module so constructing an invalid `Label` is
    /// impossible.
    octets: Bytes,
}

impl Label {
    /// Create a new, empty, label.
    pub fn new() -> Self {
        Self {
            octets: Bytes::new(),
        }
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn len(&self) -> u8 {
        // safe as the `TryFrom` ensures a label is <= 63 bytes
        self.octets.len().try_into().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.octets.is_empty()
    }

    pub fn octets(&self) -> &Bytes {
        &self.octets
    }
}

impl Default for Label {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for Label {
    type Error = LabelTryFromOctetsError;

    fn try_from(octets: &[u8]) -> Result<Self, Self::Error> {
        if octets.len() > LABEL_MAX_LEN {
            return Err(LabelTryFromOctetsError::TooLong);
        }

        Ok(Self {
            octets: Bytes::copy_from_slice(octets),
        })
    }
}

impl TryFrom<Vec<u8>> for Label {
    type Error = LabelTryFromOctetsError;

    fn try_from(octets: Vec<u8>) -> Result<Self, Self::Error> {
        if octets.len() > LABEL_MAX_LEN {
            return Err(LabelTryFromOctetsError::TooLong);
        }

        Ok(Self {
            octets: Bytes::from(octets),
        })
    }
}

impl From<Label> for Vec<u8> {
    fn from(label: Label) -> Self {
        label.octets.to_vec()
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Label {
    // only generates non-empty labels
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Label> {
        let label_len = u.int_in_range::<u8>(1..=20)?;
        let bs = u.bytes(label_len.into())?;
        let mut octets = Vec::with_capacity(bs.len());
        for b in bs {
            let ascii_byte = if b.is_ascii() { *b } else { *b % 128 };
            octets.push(
                if ascii_byte == b'.' || (ascii_byte as char).is_whitespace() {
                    b'x'
                } else {
                    ascii_byte
                },
            );
        }
        Ok(Self {
            octets: Bytes::from(octets),
        })
    }
}

/// Errors that can arise when converting a `[u8]` into a `Label`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum LabelTryFromOctetsError {
    #[error("label is longer than 63 octets")]
    TooLong,
}

/// The record types this application understands.  Questions use
/// the same set: there is no support for the query-only types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum RecordType {
    A,
    NS,
    PTR,
    AAAA,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::AAAA => write!(f, "AAAA"),
        }
    }
}

impl FromStr for RecordType {
    type Err = RecordTypeFromStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::NS),
            "PTR" => Ok(RecordType::PTR),
            "AAAA" => Ok(RecordType::AAAA),
            _ => Err(RecordTypeFromStr::NoParse),
        }
    }
}

/// Errors that can arise when converting a `&str` into a `RecordType`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum RecordTypeFromStr {
    #[error("could not parse string to type")]
    NoParse,
}

impl TryFrom<u16> for RecordType {
    type Error = UnknownRecordType;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::A),
            2 => Ok(RecordType::NS),
            12 => Ok(RecordType::PTR),
            28 => Ok(RecordType::AAAA),
            _ => Err(UnknownRecordType(value)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::PTR => 12,
            RecordType::AAAA => 28,
        }
    }
}

/// A type tag this application does not support.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
#[error("unsupported record type {0}")]
pub struct UnknownRecordType(pub u16);

/// Record classes are used by resource records and by queries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum RecordClass {
    IN,
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
        }
    }
}

impl TryFrom<u16> for RecordClass {
    type Error = UnknownRecordClass;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordClass::IN),
            _ => Err(UnknownRecordClass(value)),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
        }
    }
}

/// A class tag this application does not support.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
#[error("unsupported record class {0}")]
pub struct UnknownRecordClass(pub u16);


#[cfg(any(feature = "test-util", test))]
#[allow(clippy::missing_panics_doc)]
pub mod test_util {
    use super::*;

    use arbitrary::{Arbitrary, Unstructured};
    use rand::Rng;

    fn arbitrary_value<T: for<'a> Arbitrary<'a>>() -> T {
        let mut rng = rand::rng();
        for size in [128, 256, 512, 1024, 2048, 4096] {
            let mut buf = Vec::with_capacity(size);
            for _ in 0..size {
                buf.push(rng.random());
            }

            if let Ok(value) = T::arbitrary(&mut Unstructured::new(&buf)) {
                return value;
            }
        }

        panic!("could not generate arbitrary value!");
    }

    pub fn arbitrary_message() -> Message {
        arbitrary_value()
    }

    pub fn arbitrary_resourcerecord() -> ResourceRecord {
        arbitrary_value()
    }

    pub fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    pub fn a_record(name: &str, address: Ipv4Addr) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::A { address },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    pub fn aaaa_record(name: &str, address: Ipv6Addr) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::AAAA { address },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    pub fn ns_record(superdomain_name: &str, nameserver_name: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(superdomain_name),
            rtype_with_data: RecordTypeWithData::NS {
                nsdname: domain(nameserver_name),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    pub fn ptr_record(name: &str, target_name: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::PTR {
                ptrdname: domain(target_name),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }
}
