//! TXT to CAA wire rewriting
//!
//! CAA answers are first emitted as single-string TXT records shaped like
//! `0 issue ";"`. This pass scans the serialized packet and rewrites each
//! matching TXT resource record into a real type-257 CAA record in place:
//! same class, same TTL, RDATA re-encoded as `flags | tag_len | tag | value`.
//! The two spaces and two quotes drop out, so the record shrinks by four
//! bytes. Anything that does not parse cleanly is left untouched.

const TYPE_TXT: u8 = 16;
const CLASS_IN: u8 = 1;

/// Minimum matchable record tail: type + class + ttl + rdlength + the
/// shortest payload, `0 issue ";"`.
const MIN_RECORD: usize = 22;

/// Shortest payload: `0 issue ";"`.
const MIN_VALUE: usize = 11;

/// Rewrite every CAA-shaped TXT record in a serialized DNS message.
pub fn convert_txt_to_caa(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match txt_to_caa(&input[i..]) {
            Some((skip, record)) => {
                out.extend_from_slice(&record);
                i += skip;
            }
            None => {
                out.push(input[i]);
                i += 1;
            }
        }
    }
    out
}

/// Try to parse a TXT record tail (starting at the TYPE field) holding a
/// single CAA-shaped character-string. Returns the number of input bytes
/// consumed and the replacement record tail.
fn txt_to_caa(rec: &[u8]) -> Option<(usize, Vec<u8>)> {
    if rec.len() < MIN_RECORD {
        return None;
    }
    if rec[0] != 0 || rec[1] != TYPE_TXT || rec[2] != 0 || rec[3] != CLASS_IN {
        return None;
    }
    // single character-string filling the whole RDATA
    if rec[8] != 0 || usize::from(rec[9]) != usize::from(rec[10]) + 1 {
        return None;
    }

    let rec = rec.get(..11 + usize::from(rec[10]))?;
    let mut value = &rec[11..];

    if value.len() < MIN_VALUE {
        return None;
    }

    let flags: u8 = match value[0] {
        b'0' => 0,
        b'1' => 128,
        _ => return None,
    };

    if *value.last()? != b'"' {
        return None;
    }
    value = &value[..value.len() - 1];

    let tag: &[u8] = [&b"issue"[..], b"issuewild", b"iodef"]
        .into_iter()
        .find(|tag| {
            let prefix_len = 1 + 1 + tag.len() + 2;
            value.len() >= prefix_len
                && value[1] == b' '
                && &value[2..2 + tag.len()] == *tag
                && &value[2 + tag.len()..prefix_len] == b" \""
        })?;
    let value = &value[1 + 1 + tag.len() + 2..];

    let mut data = Vec::with_capacity(rec.len() - 4); // removed 2 spaces, 2 quotes
    data.extend_from_slice(&[1, 1]); // TYPE CAA
    data.extend_from_slice(&[0, CLASS_IN]);
    data.extend_from_slice(&rec[4..8]); // TTL
    data.extend_from_slice(&[0, rec[9] - 4]); // removed 2 spaces, 2 quotes
    data.push(flags);
    data.push(tag.len() as u8);
    data.extend_from_slice(tag);
    data.extend_from_slice(value);
    Some((rec.len(), data))
}
