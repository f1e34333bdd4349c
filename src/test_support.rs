use std::iter::repeat_with;
use std::sync::Arc;

use crate::protocol::{self as fcgi, body, RecordHeader, RecordType};
use crate::transport::MemoryTransport;
use crate::{Config, Connection, Error, Request};


/// Calls `feed` with consecutive random-sized chunks of `input`.
pub(crate) fn feed_randomly<E>(
    mut input: &[u8],
    mut feed: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    while !input.is_empty() {
        let n = fastrand::usize(1..=input.len().min(97));
        feed(&input[..n])?;
        input = &input[n..];
    }
    Ok(())
}

pub(crate) fn add_begin(buf: &mut Vec<u8>, req_id: u16, role: fcgi::Role, keep_conn: bool) {
    let flags = if keep_conn { fcgi::RequestFlags::KeepConn } else { fcgi::RequestFlags::empty() };
    buf.extend(body::BeginRequest { role, flags }.to_record(req_id));
}

/// Adds a BeginRequest record with an arbitrary role code.
pub(crate) fn add_begin_raw(buf: &mut Vec<u8>, req_id: u16, role: u16, flags: u8) {
    let mut head = RecordHeader::new(RecordType::BeginRequest, req_id);
    head.content_length = 8;
    buf.extend(head.to_bytes());
    buf.extend(role.to_be_bytes());
    buf.extend([flags, 0, 0, 0, 0, 0]);
}

pub(crate) fn add_abort(buf: &mut Vec<u8>, req_id: u16) {
    buf.extend(RecordHeader::new(RecordType::AbortRequest, req_id).to_bytes());
}

/// Asks for all three protocol variables.
pub(crate) fn add_get_values(buf: &mut Vec<u8>) {
    const VALS: &[u8] = b"\x0e\x00FCGI_MAX_CONNS\x0d\x00FCGI_MAX_REQS\x0f\x00FCGI_MPXS_CONNS";
    let mut head = RecordHeader::new(RecordType::GetValues, fcgi::FCGI_NULL_REQUEST_ID);
    head.content_length = VALS.len() as u16;
    buf.extend(head.to_bytes());
    buf.extend(VALS);
}

/// Adds a record with the raw type `rtype` and a random body.
pub(crate) fn add_unknown(buf: &mut Vec<u8>, req_id: u16, rtype: u8) {
    let rand_len = fastrand::u16(10..512);
    let mut head = [0; 8];
    head[0] = 1;
    head[1] = rtype;
    head[2..4].copy_from_slice(&req_id.to_be_bytes());
    head[4..6].copy_from_slice(&rand_len.to_be_bytes());
    buf.extend(head);
    buf.extend(repeat_with(|| fastrand::u8(..)).take(rand_len.into()));
}

/// Adds `data` as records of at most `chunk` bytes, followed by the stream
/// terminator. Does not check that `rtype` is a stream.
pub(crate) fn add_stream(buf: &mut Vec<u8>, req_id: u16, rtype: RecordType, data: &[u8], chunk: usize) {
    let mut head = RecordHeader::new(rtype, req_id);
    for part in data.chunks(chunk.max(1)) {
        head.content_length = part.len() as u16;
        buf.extend(head.to_bytes());
        buf.extend(part);
    }
    head.content_length = 0;
    buf.extend(head.to_bytes());
}

/// Encodes `params` as one PARAMS stream, splitting it into records of
/// `chunk` bytes regardless of pair boundaries.
pub(crate) fn add_params(buf: &mut Vec<u8>, req_id: u16, params: &[(&[u8], &[u8])], chunk: usize) {
    let mut encoded = Vec::new();
    for &pair in params {
        fcgi::nv::write(pair, &mut encoded).unwrap();
    }
    add_stream(buf, req_id, RecordType::Params, &encoded, chunk);
}

/// Replaces the padding of every record in `buf` with a random amount of
/// random bytes.
pub(crate) fn randomize_padding(buf: &mut Vec<u8>) {
    let mut head_start = 0;
    while let Some(head) = buf.get_mut(head_start..(head_start + 8)) {
        let payload = u16::from_be_bytes([head[4], head[5]]);
        let old_pad = head[6];
        let new_pad = fastrand::u8(..);
        head[6] = new_pad;

        head_start += 8 + usize::from(payload);
        buf.splice(
            head_start..(head_start + usize::from(old_pad)),
            repeat_with(|| fastrand::u8(..)).take(new_pad.into()),
        );
        head_start += usize::from(new_pad);
    }
}


/// Splits application output into records, dropping their padding.
pub(crate) fn parse_records(mut out: &[u8]) -> Vec<(RecordHeader, Vec<u8>)> {
    let mut records = Vec::new();
    while !out.is_empty() {
        let mut head = [0; 8];
        head.copy_from_slice(&out[..8]);
        let head = RecordHeader::from_bytes(head).unwrap();
        let body = out[8..(8 + usize::from(head.content_length))].to_vec();
        out = &out[(8 + head.body_len())..];
        records.push((head, body));
    }
    records
}

/// Concatenates the bodies of all `rtype` records for `req_id`.
pub(crate) fn stream_of(out: &[u8], req_id: u16, rtype: RecordType) -> Vec<u8> {
    parse_records(out)
        .into_iter()
        .filter(|(h, _)| h.request_id == req_id && h.rtype == rtype)
        .flat_map(|(_, b)| b)
        .collect()
}

pub(crate) fn end_requests(out: &[u8]) -> Vec<(u16, body::EndRequest)> {
    parse_records(out)
        .into_iter()
        .filter(|(h, _)| h.rtype == RecordType::EndRequest)
        .map(|(h, b)| {
            let mut data = [0; 8];
            data.copy_from_slice(&b);
            (h.request_id, body::EndRequest::from_bytes(data).unwrap())
        })
        .collect()
}


/// Builds a single Responder request with `params` and STDIN `body`.
pub(crate) fn request_input(keep_conn: bool, params: &[(&[u8], &[u8])], body: &[u8]) -> Vec<u8> {
    let mut input = Vec::new();
    add_begin(&mut input, 1, fcgi::Role::Responder, keep_conn);
    add_params(&mut input, 1, params, 7);
    add_stream(&mut input, 1, RecordType::Stdin, body, 13);
    randomize_padding(&mut input);
    input
}

/// Accepts the first request of `input` into a fresh [`Request`].
pub(crate) fn accepted(input: &[u8], config: Config) -> Result<(Request, Arc<MemoryTransport>), Error> {
    let transport = Arc::new(MemoryTransport::with_input(input));
    let config = Arc::new(config);
    let conn = Connection::new(transport.clone(), Arc::clone(&config));
    let client = conn.next_request()?.ok_or(Error::Eof)?;
    let mut req = Request::new(config);
    req.accept(client)?;
    Ok((req, transport))
}
