//! Seekable metadata rebuild
//!
//! Produces a new leading metadata block: the original EBML header, an
//! unknown-size Segment header, then SeekHead, Info (with Duration), Tracks
//! and Cues. Cue cluster positions are shifted by the size difference between
//! the old and new metadata blocks, and the SeekHead points at the rewritten
//! elements. Both depend on their own encoded lengths, so the layout is
//! iterated until it stops changing.

use super::ebml::{self, ids};
use super::reader::{CuePoint, ScannedMetadata};
use super::RepairError;

/// Layout passes before giving up; sizes only grow, so this is never reached
/// for sane input
const MAX_LAYOUT_PASSES: usize = 16;

/// Rebuild the metadata block of `metadata` so players can seek.
///
/// `duration_ms` is the real length of the recording and `cues` the cue list
/// produced by the scanner (positions relative to the original Segment data).
pub fn make_metadata_seekable(
    metadata: &ScannedMetadata,
    duration_ms: f64,
    cues: &[CuePoint],
) -> Result<Vec<u8>, RepairError> {
    let info = rebuild_info(metadata, duration_ms)?;
    let tracks = metadata
        .element(ids::TRACKS)
        .ok_or(RepairError::MissingElement("Tracks"))?
        .bytes
        .clone();

    let mut prefix = metadata.ebml_header.clone();
    ebml::write_unknown_size_header(&mut prefix, ids::SEGMENT);
    let new_segment_data_start = prefix.len() as u64;

    // Absolute offset of the original media body and of its clusters
    let old_body_start = metadata.metadata_size as u64;
    let old_segment_data_start = metadata.segment_data_start as u64;

    let mut seek_head_len = 0usize;
    let mut cues_len = 0usize;

    for pass in 0..MAX_LAYOUT_PASSES {
        let info_position = seek_head_len as u64;
        let tracks_position = info_position + info.len() as u64;
        let cues_position = tracks_position + tracks.len() as u64;
        let new_body_start = new_segment_data_start + cues_position + cues_len as u64;

        let shifted: Vec<CuePoint> = cues
            .iter()
            .map(|cue| {
                let absolute = old_segment_data_start + cue.cluster_position;
                CuePoint {
                    cluster_position: absolute - old_body_start + new_body_start
                        - new_segment_data_start,
                    ..*cue
                }
            })
            .collect();

        let cues_element = if shifted.is_empty() {
            Vec::new()
        } else {
            encode_cues(&shifted)
        };

        let mut entries = vec![(ids::INFO, info_position), (ids::TRACKS, tracks_position)];
        if !cues_element.is_empty() {
            entries.push((ids::CUES, cues_position));
        }
        let seek_head = encode_seek_head(&entries);

        if seek_head.len() == seek_head_len && cues_element.len() == cues_len {
            tracing::debug!(
                "Seekable metadata laid out in {} passes ({} cues, {} bytes)",
                pass + 1,
                shifted.len(),
                new_body_start
            );

            let mut out = prefix;
            out.reserve(seek_head.len() + info.len() + tracks.len() + cues_element.len());
            out.extend_from_slice(&seek_head);
            out.extend_from_slice(&info);
            out.extend_from_slice(&tracks);
            out.extend_from_slice(&cues_element);
            return Ok(out);
        }

        seek_head_len = seek_head.len();
        cues_len = cues_element.len();
    }

    Err(RepairError::LayoutDidNotConverge)
}

/// Copy the original Info children, replacing any Duration with the real one
fn rebuild_info(metadata: &ScannedMetadata, duration_ms: f64) -> Result<Vec<u8>, RepairError> {
    let mut body = Vec::new();

    if let Some(info) = metadata.element(ids::INFO) {
        let (_, id_len) =
            ebml::read_id(&info.bytes, 0)?.ok_or(RepairError::MissingElement("Info"))?;
        let (_, size_len) =
            ebml::read_size(&info.bytes, id_len)?.ok_or(RepairError::MissingElement("Info"))?;
        let children = &info.bytes[id_len + size_len..];

        let mut offset = 0;
        while offset < children.len() {
            let Some((id, id_len)) = ebml::read_id(children, offset)? else {
                break;
            };
            let Some((Some(size), size_len)) = ebml::read_size(children, offset + id_len)? else {
                break;
            };
            let end = (offset + id_len + size_len + size as usize).min(children.len());
            if id != ids::DURATION {
                body.extend_from_slice(&children[offset..end]);
            }
            offset = end;
        }
    } else {
        body.extend(ebml::uint(ids::TIMECODE_SCALE, metadata.timecode_scale));
    }

    let duration = duration_ms * 1_000_000.0 / metadata.timecode_scale as f64;
    body.extend(ebml::float(ids::DURATION, duration));

    Ok(ebml::master(ids::INFO, &body))
}

fn encode_seek_head(entries: &[(u32, u64)]) -> Vec<u8> {
    let mut body = Vec::new();
    for &(id, position) in entries {
        let mut id_bytes = Vec::new();
        ebml::write_id(&mut id_bytes, id);

        let mut seek = ebml::binary(ids::SEEK_ID, &id_bytes);
        seek.extend(ebml::uint(ids::SEEK_POSITION, position));
        body.extend(ebml::master(ids::SEEK, &seek));
    }
    ebml::master(ids::SEEK_HEAD, &body)
}

fn encode_cues(cues: &[CuePoint]) -> Vec<u8> {
    let mut body = Vec::new();
    for cue in cues {
        let mut positions = ebml::uint(ids::CUE_TRACK, cue.track);
        positions.extend(ebml::uint(ids::CUE_CLUSTER_POSITION, cue.cluster_position));

        let mut point = ebml::uint(ids::CUE_TIME, cue.time);
        point.extend(ebml::master(ids::CUE_TRACK_POSITIONS, &positions));
        body.extend(ebml::master(ids::CUE_POINT, &point));
    }
    ebml::master(ids::CUES, &body)
}
