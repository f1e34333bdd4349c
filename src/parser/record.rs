use crate::protocol::{self as fcgi, body, RecordHeader, RecordType};
use crate::Error;


/// A demultiplexed unit of the record stream.
///
/// Events borrow from the input passed to `Demux::feed` and are only valid
/// during the callback.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// A BeginRequest record with a supported body.
    Begin { request_id: u16, body: body::BeginRequest },
    /// An AbortRequest record.
    Abort { request_id: u16 },
    /// Payload of a PARAMS, STDIN or DATA record. A record may be reported in
    /// multiple parts. An empty `data` slice marks the end of the stream.
    Stream { request_id: u16, rtype: RecordType, data: &'a [u8] },
    /// A complete GetValues management record.
    GetValues(fcgi::ProtocolVariables),
    /// A record of a type this crate does not know. The caller should
    /// answer with an UnknownType record.
    UnknownType { request_id: u16, rtype: u8 },
    /// A BeginRequest record with an unknown role. The caller should answer
    /// with an EndRequest record with `ProtocolStatus::UnknownRole`.
    UnknownRole { request_id: u16, role: u16 },
}


#[derive(Debug, Clone)]
enum State {
    /// Collecting the 8 header bytes of the next record.
    Header { buf: [u8; RecordHeader::LEN], len: usize },
    /// Collecting the body of a BeginRequest record.
    Begin { head: RecordHeader, buf: [u8; body::BeginRequest::LEN], len: usize },
    /// Passing through the payload of a stream record.
    Stream { head: RecordHeader, rem: usize },
    /// Collecting the body of a GetValues record.
    Values { buf: Vec<u8>, rem: usize, padding: u8 },
    /// Discarding `rem` bytes of payload and/or padding.
    Skip { rem: usize },
    /// An undecodable header was encountered. The stream cannot be resynchronized.
    Fatal(fcgi::Error),
    /// A panic occurred while the state was taken out.
    Poisoned,
}

impl State {
    const HEADER: Self = Self::Header { buf: [0; RecordHeader::LEN], len: 0 };

    #[inline]
    fn skip(rem: usize) -> Self {
        if rem == 0 { Self::HEADER } else { Self::Skip { rem } }
    }

    /// Copies bytes from `data` into `buf[*len..]`, returning the rest of `data`.
    fn fill<'a>(buf: &mut [u8], len: &mut usize, data: &'a [u8]) -> &'a [u8] {
        let take = (buf.len() - *len).min(data.len());
        buf[*len..(*len + take)].copy_from_slice(&data[..take]);
        *len += take;
        &data[take..]
    }

    /// Consumes a prefix of `data`, returning the unconsumed rest and the next state.
    fn step<'a>(self, data: &'a [u8], emit: &mut impl FnMut(Event)) -> (&'a [u8], Self) {
        match self {
            Self::Header { mut buf, mut len } => {
                let data = Self::fill(&mut buf, &mut len, data);
                if len < buf.len() {
                    return (data, Self::Header { buf, len });
                }
                (data, Self::on_header(buf, emit))
            },

            Self::Begin { head, mut buf, mut len } => {
                let data = Self::fill(&mut buf, &mut len, data);
                if len < buf.len() {
                    return (data, Self::Begin { head, buf, len });
                }
                let request_id = head.request_id;
                match body::BeginRequest::from_bytes(buf) {
                    Ok(body) => emit(Event::Begin { request_id, body }),
                    Err(fcgi::Error::UnknownRole(role)) => emit(Event::UnknownRole { request_id, role }),
                    Err(e) => tracing::warn!(request_id, error = %e, "invalid BeginRequest body skipped"),
                }
                (data, Self::skip(head.padding_length.into()))
            },

            Self::Stream { head, rem } => {
                let take = rem.min(data.len());
                if take > 0 {
                    emit(Event::Stream {
                        request_id: head.request_id, rtype: head.rtype, data: &data[..take],
                    });
                }
                let rem = rem - take;
                let next = if rem == 0 {
                    Self::skip(head.padding_length.into())
                } else {
                    Self::Stream { head, rem }
                };
                (&data[take..], next)
            },

            Self::Values { mut buf, rem, padding } => {
                let take = rem.min(data.len());
                buf.extend_from_slice(&data[..take]);
                let rem = rem - take;
                if rem > 0 {
                    return (&data[take..], Self::Values { buf, rem, padding });
                }
                emit(Event::GetValues(fcgi::ProtocolVariables::from_query(&buf)));
                (&data[take..], Self::skip(padding.into()))
            },

            Self::Skip { rem } => {
                let take = rem.min(data.len());
                (&data[take..], Self::skip(rem - take))
            },

            s @ (Self::Fatal(_) | Self::Poisoned) => (&[], s),
        }
    }

    fn on_header(raw: [u8; RecordHeader::LEN], emit: &mut impl FnMut(Event)) -> Self {
        let head = match RecordHeader::from_bytes(raw) {
            Ok(h) => h,
            Err(fcgi::Error::UnknownRecordType(rtype)) => {
                let request_id = fcgi::join_u16(raw[2], raw[3]);
                let content = fcgi::join_u16(raw[4], raw[5]);
                tracing::info!(request_id, rtype, "unknown record type ignored");
                emit(Event::UnknownType { request_id, rtype });
                return Self::skip(usize::from(content) + usize::from(raw[6]));
            },
            Err(e) => return Self::Fatal(e),
        };
        crate::macros::trace!(header = ?head, "record received");

        let request_id = head.request_id;
        let padding = usize::from(head.padding_length);
        let body_len = head.body_len();
        let management = head.is_management();
        match head.rtype {
            RecordType::BeginRequest if management => {
                tracing::warn!("BeginRequest with reserved request ID 0 skipped");
                Self::skip(body_len)
            },
            RecordType::BeginRequest if usize::from(head.content_length) != body::BeginRequest::LEN => {
                tracing::warn!(request_id, len = head.content_length, "BeginRequest with invalid length skipped");
                Self::skip(body_len)
            },
            RecordType::BeginRequest => {
                Self::Begin { head, buf: [0; body::BeginRequest::LEN], len: 0 }
            },

            RecordType::AbortRequest if !management => {
                emit(Event::Abort { request_id });
                Self::skip(body_len)
            },

            RecordType::Params | RecordType::Stdin | RecordType::Data if !management => {
                if head.content_length == 0 {
                    emit(Event::Stream { request_id, rtype: head.rtype, data: &[] });
                    Self::skip(padding)
                } else {
                    Self::Stream { head, rem: head.content_length.into() }
                }
            },

            RecordType::GetValues if management && head.content_length == 0 => {
                emit(Event::GetValues(fcgi::ProtocolVariables::empty()));
                Self::skip(padding)
            },
            RecordType::GetValues if management => Self::Values {
                buf: Vec::with_capacity(head.content_length.into()),
                rem: head.content_length.into(),
                padding: head.padding_length,
            },

            rtype => {
                tracing::debug!(request_id, ?rtype, "unexpected record skipped");
                Self::skip(body_len)
            },
        }
    }
}


/// A sans-IO demultiplexer for the record stream sent by a web server.
///
/// Bytes are passed in via `Demux::feed` in chunks of any size, down to a
/// single byte. The demultiplexer keeps track of record boundaries and
/// reports each record's contents as [`Event`]s. Stream payloads are passed
/// through without copying, everything else is buffered until complete.
///
/// Protocol violations that concern a single record (a BeginRequest with
/// request ID 0 or a wrong length, stream records for the null request) are
/// logged and skipped. Only a header with an unsupported version is fatal,
/// since the length of such a record cannot be known.
#[derive(Debug, Clone)]
pub struct Demux {
    state: State,
}

impl Default for Demux {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Demux {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::HEADER }
    }

    /// Tests whether the demultiplexer is positioned between two records.
    #[inline]
    #[must_use]
    pub fn is_record_boundary(&self) -> bool {
        matches!(self.state, State::Header { len: 0, .. })
    }

    /// Consumes all of `data`, reporting every completed part of a record to
    /// `on_event`.
    ///
    /// # Errors
    /// Fails with [`Error::MalformedHeader`] if a record header cannot be
    /// decoded. All later calls fail with the same error.
    pub fn feed(&mut self, mut data: &[u8], mut on_event: impl FnMut(Event)) -> Result<(), Error> {
        while !data.is_empty() {
            data = replace_with::replace_with_and_return(
                &mut self.state, || State::Poisoned,
                |s| s.step(data, &mut on_event),
            );
            if matches!(self.state, State::Fatal(_) | State::Poisoned) {
                break;
            }
        }
        match &self.state {
            State::Fatal(e) => Err(Error::MalformedHeader(e.clone())),
            State::Poisoned => Err(Error::Paniced),
            _ => Ok(()),
        }
    }
}
