//! EBML element decoding and encoding
//!
//! Only the subset needed to rewrite the leading metadata of a WebM stream:
//! variable-length integers, a flat element walk, and writers for master,
//! unsigned integer, and float elements.

use super::RepairError;

/// Element IDs used by the repair step (marker bits included, as written on disk)
pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

/// Size marker for elements of unknown length (8-byte form)
const UNKNOWN_SIZE_8: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Default Matroska timecode scale (1 ms in nanoseconds)
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// A decoded element header with its position in the source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub id: u32,
    /// Offset of the first ID byte
    pub tag_start: usize,
    /// Offset of the first payload byte
    pub data_start: usize,
    /// Payload length, `None` when the element has unknown size
    pub size: Option<u64>,
}

impl Element {
    /// Whether the walk descends into this element instead of skipping it
    pub fn is_master(&self) -> bool {
        is_master(self.id)
    }

    /// End offset of the payload, if the size is known
    pub fn data_end(&self) -> Option<usize> {
        self.size.map(|size| self.data_start + size as usize)
    }

    /// The payload bytes of a sized element
    pub fn data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        match self.data_end() {
            Some(end) => &buf[self.data_start..end.min(buf.len())],
            None => &buf[self.data_start..],
        }
    }

    /// The whole element (header and payload) of a sized element
    pub fn raw<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        match self.data_end() {
            Some(end) => &buf[self.tag_start..end.min(buf.len())],
            None => &buf[self.tag_start..],
        }
    }
}

fn is_master(id: u32) -> bool {
    matches!(
        id,
        ids::SEGMENT
            | ids::INFO
            | ids::TRACKS
            | ids::TRACK_ENTRY
            | ids::CLUSTER
            | ids::BLOCK_GROUP
            | ids::CUES
            | ids::CUE_POINT
            | ids::CUE_TRACK_POSITIONS
    )
}

/// Length of a vint from its first byte (1..=8), `None` for 0x00
fn vint_length(first: u8) -> Option<usize> {
    if first == 0 {
        None
    } else {
        Some(first.leading_zeros() as usize + 1)
    }
}

/// Read an element ID (marker bits kept). Returns `(id, length)`.
pub fn read_id(buf: &[u8], offset: usize) -> Result<Option<(u32, usize)>, RepairError> {
    let Some(&first) = buf.get(offset) else {
        return Ok(None);
    };
    let len = vint_length(first).ok_or(RepairError::InvalidVint { offset })?;
    if len > 4 {
        return Err(RepairError::InvalidVint { offset });
    }
    if offset + len > buf.len() {
        return Ok(None);
    }
    let id = buf[offset..offset + len]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok(Some((id, len)))
}

/// Read a data-size vint. Returns `(size, length)` with `None` size for
/// the reserved all-ones (unknown) value.
pub fn read_size(buf: &[u8], offset: usize) -> Result<Option<(Option<u64>, usize)>, RepairError> {
    let Some(&first) = buf.get(offset) else {
        return Ok(None);
    };
    let len = vint_length(first).ok_or(RepairError::InvalidVint { offset })?;
    if offset + len > buf.len() {
        return Ok(None);
    }
    let (value, all_ones) = read_vint_value(&buf[offset..offset + len]);
    Ok(Some((if all_ones { None } else { Some(value) }, len)))
}

/// Decode a vint with the length marker removed. The flag reports whether
/// every value bit was set.
fn read_vint_value(bytes: &[u8]) -> (u64, bool) {
    let len = bytes.len();
    let mask = if len >= 8 { 0 } else { 0xFFu8 >> len };
    let mut value = (bytes[0] & mask) as u64;
    let mut all_ones = bytes[0] & mask == mask;
    for &b in &bytes[1..] {
        value = (value << 8) | b as u64;
        all_ones &= b == 0xFF;
    }
    (value, all_ones)
}

/// Walk every element of `buf` in document order, descending into masters.
///
/// A truncated element at the tail ends the walk without error; a stream cut
/// mid-cluster still yields everything before the cut.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Element>, RepairError> {
    let mut elements = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let Some((id, id_len)) = read_id(buf, offset)? else {
            break;
        };
        let Some((size, size_len)) = read_size(buf, offset + id_len)? else {
            break;
        };

        let element = Element {
            id,
            tag_start: offset,
            data_start: offset + id_len + size_len,
            size,
        };

        if element.is_master() {
            elements.push(element);
            offset = element.data_start;
            continue;
        }

        let Some(end) = element.data_end() else {
            return Err(RepairError::UnknownSizedLeaf {
                id,
                offset: element.tag_start,
            });
        };
        if end > buf.len() {
            tracing::debug!(
                "Truncated element 0x{:X} at offset {} ({} bytes past end)",
                id,
                offset,
                end - buf.len()
            );
            break;
        }
        elements.push(element);
        offset = end;
    }

    Ok(elements)
}

/// Read a big-endian unsigned integer payload
pub fn read_uint(data: &[u8]) -> u64 {
    data.iter().take(8).fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Read a float payload (4 or 8 bytes, empty means 0.0)
pub fn read_float(data: &[u8]) -> Option<f64> {
    match data.len() {
        0 => Some(0.0),
        4 => Some(f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            Some(f64::from_be_bytes(bytes))
        }
        _ => None,
    }
}

/// Track number, relative timecode, and flags from a (Simple)Block payload
pub fn read_block_header(data: &[u8]) -> Option<(u64, i16, u8)> {
    let len = vint_length(*data.first()?)?;
    if data.len() < len + 3 {
        return None;
    }
    let (track, _) = read_vint_value(&data[..len]);
    let timecode = i16::from_be_bytes([data[len], data[len + 1]]);
    Some((track, timecode, data[len + 2]))
}

/// Append an element ID
pub fn write_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(3);
    out.extend_from_slice(&bytes[skip..]);
}

/// Append a data size using the shortest vint that is not the reserved value
pub fn write_size(out: &mut Vec<u8>, size: u64) {
    let mut len = 1;
    while len < 8 && size >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    let marked = size | (1u64 << (7 * len));
    out.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}

/// Append a master element header with unknown size
pub fn write_unknown_size_header(out: &mut Vec<u8>, id: u32) {
    write_id(out, id);
    out.extend_from_slice(&UNKNOWN_SIZE_8);
}

/// Encode a master element around an already encoded body
pub fn master(id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 12);
    write_id(&mut out, id);
    write_size(&mut out, body.len() as u64);
    out.extend_from_slice(body);
    out
}

/// Encode an unsigned integer element with the minimal payload width
pub fn uint(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    master(id, &bytes[skip..])
}

/// Encode an 8-byte float element
pub fn float(id: u32, value: f64) -> Vec<u8> {
    master(id, &value.to_be_bytes())
}

/// Encode a binary element
pub fn binary(id: u32, value: &[u8]) -> Vec<u8> {
    master(id, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_encoding_avoids_reserved_values() {
        let mut out = Vec::new();
        write_size(&mut out, 0x7E);
        assert_eq!(out, vec![0xFE]);

        // 0x7F would be the 1-byte unknown marker
        let mut out = Vec::new();
        write_size(&mut out, 0x7F);
        assert_eq!(out, vec![0x40, 0x7F]);

        let (value, len) = read_size(&out, 0).unwrap().unwrap();
        assert_eq!(value, Some(0x7F));
        assert_eq!(len, 2);
    }

    #[test]
    fn test_unknown_size_is_detected() {
        let mut out = Vec::new();
        write_unknown_size_header(&mut out, ids::SEGMENT);
        let (id, id_len) = read_id(&out, 0).unwrap().unwrap();
        assert_eq!(id, ids::SEGMENT);
        assert_eq!(id_len, 4);
        let (size, size_len) = read_size(&out, id_len).unwrap().unwrap();
        assert_eq!(size, None);
        assert_eq!(size_len, 8);
    }

    #[test]
    fn test_uint_uses_minimal_width() {
        assert_eq!(uint(ids::TRACK_NUMBER, 1), vec![0xD7, 0x81, 0x01]);
        assert_eq!(uint(ids::CUE_TIME, 0), vec![0xB3, 0x81, 0x00]);
        assert_eq!(
            uint(ids::TIMECODE_SCALE, DEFAULT_TIMECODE_SCALE),
            vec![0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]
        );
    }

    #[test]
    fn test_decode_descends_into_unknown_sized_masters() {
        let mut buf = master(ids::EBML, &[0x42, 0x86, 0x81, 0x01]);
        write_unknown_size_header(&mut buf, ids::SEGMENT);
        write_unknown_size_header(&mut buf, ids::CLUSTER);
        buf.extend(uint(ids::TIMECODE, 40));
        buf.extend(binary(ids::SIMPLE_BLOCK, &[0x81, 0x00, 0x00, 0x80, 0xAA]));

        let elements = decode_all(&buf).unwrap();
        let found: Vec<u32> = elements.iter().map(|e| e.id).collect();
        assert_eq!(
            found,
            vec![ids::EBML, ids::SEGMENT, ids::CLUSTER, ids::TIMECODE, ids::SIMPLE_BLOCK]
        );

        let block = elements[4];
        assert_eq!(read_block_header(block.data(&buf)), Some((1, 0, 0x80)));
    }

    #[test]
    fn test_decode_stops_at_truncated_tail() {
        let mut buf = uint(ids::TIMECODE, 7);
        buf.extend_from_slice(&[0xA3, 0x88, 0x81, 0x00]);
        let elements = decode_all(&buf).unwrap();
        assert_eq!(elements.len(), 1);
    }

    #[test]
    fn test_decode_rejects_zero_vint() {
        let buf = [0x00, 0x81, 0x00];
        assert!(matches!(
            decode_all(&buf),
            Err(RepairError::InvalidVint { offset: 0 })
        ));
    }

    #[test]
    fn test_float_round_trip() {
        let encoded = float(ids::DURATION, 1234.5);
        let elements = decode_all(&encoded).unwrap();
        assert_eq!(read_float(elements[0].data(&encoded)), Some(1234.5));
    }
}
