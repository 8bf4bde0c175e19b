//! Metadata scanner
//!
//! Consumes the decoded element walk of a recorder-produced WebM stream and
//! collects what the seekable rewrite needs: the EBML header, the level-1
//! metadata elements in front of the first cluster, a cue per keyframe
//! cluster, and the offset where the media body begins.

use super::ebml::{self, ids, Element, DEFAULT_TIMECODE_SCALE};
use super::RepairError;

/// Matroska TrackType value for video tracks
const TRACK_TYPE_VIDEO: u64 = 1;

/// A level-1 child of the Segment found before the first cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataElement {
    pub id: u32,
    /// The full element, header included
    pub bytes: Vec<u8>,
}

/// One seek index entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CuePoint {
    /// Cluster timecode in timecode-scale units
    pub time: u64,
    pub track: u64,
    /// Cluster offset relative to the first byte of Segment data
    pub cluster_position: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackInfo {
    number: Option<u64>,
    kind: Option<u64>,
}

/// Everything the scanner learned about a stream
#[derive(Debug, Clone)]
pub struct ScannedMetadata {
    /// The EBML header element, header included
    pub ebml_header: Vec<u8>,
    /// Level-1 Segment children in front of the first cluster
    pub elements: Vec<MetadataElement>,
    /// Cues generated from keyframe clusters
    pub cues: Vec<CuePoint>,
    /// Cues read from an existing Cues element
    pub indexed_cues: Vec<CuePoint>,
    /// Byte length of the leading metadata (offset of the first cluster)
    pub metadata_size: usize,
    /// Offset of the first byte of Segment data
    pub segment_data_start: usize,
    pub timecode_scale: u64,
    /// Duration recorded in the Info element, in timecode-scale units
    pub duration: Option<f64>,
    /// Highest absolute block timecode seen
    pub last_timecode: Option<u64>,
}

impl ScannedMetadata {
    /// Find a metadata element by ID
    pub fn element(&self, id: u32) -> Option<&MetadataElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Duration from the Info element converted to milliseconds
    pub fn duration_ms(&self) -> Option<f64> {
        self.duration
            .map(|d| d * self.timecode_scale as f64 / 1_000_000.0)
    }
}

/// Stateful reader fed one element at a time in document order
#[derive(Debug, Default)]
pub struct MetadataReader {
    ebml_header: Option<Vec<u8>>,
    elements: Vec<MetadataElement>,
    cues: Vec<CuePoint>,
    indexed_cues: Vec<CuePoint>,
    pending_cue: Option<CuePoint>,
    metadata_size: Option<usize>,
    segment_data_start: Option<usize>,
    /// Offset where the next level-1 Segment child is expected
    next_level1: Option<usize>,
    timecode_scale: Option<u64>,
    duration: Option<f64>,
    tracks: Vec<TrackInfo>,
    cluster_position: Option<u64>,
    cluster_timecode: u64,
    cued_cluster: Option<u64>,
    last_timecode: Option<u64>,
}

impl MetadataReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next element of the walk
    pub fn read(&mut self, element: &Element, buf: &[u8]) -> Result<(), RepairError> {
        if self.metadata_size.is_none() && Some(element.tag_start) == self.next_level1 {
            self.read_level1(element, buf)?;
        }

        match element.id {
            ids::EBML if self.ebml_header.is_none() => {
                self.ebml_header = Some(element.raw(buf).to_vec());
            }
            ids::SEGMENT if self.segment_data_start.is_none() => {
                self.segment_data_start = Some(element.data_start);
                self.next_level1 = Some(element.data_start);
            }
            ids::TIMECODE_SCALE => {
                self.timecode_scale = Some(ebml::read_uint(element.data(buf)));
            }
            ids::DURATION => {
                self.duration = ebml::read_float(element.data(buf));
            }
            ids::TRACK_ENTRY => self.tracks.push(TrackInfo::default()),
            ids::TRACK_NUMBER => {
                if let Some(track) = self.tracks.last_mut() {
                    track.number = Some(ebml::read_uint(element.data(buf)));
                }
            }
            ids::TRACK_TYPE => {
                if let Some(track) = self.tracks.last_mut() {
                    track.kind = Some(ebml::read_uint(element.data(buf)));
                }
            }
            ids::CLUSTER => {
                let segment_start = self.segment_data_start.ok_or(RepairError::MissingSegment)?;
                self.cluster_position = Some((element.tag_start - segment_start) as u64);
                self.cluster_timecode = 0;
            }
            ids::TIMECODE => {
                self.cluster_timecode = ebml::read_uint(element.data(buf));
            }
            ids::SIMPLE_BLOCK => {
                if let Some((track, relative, flags)) = ebml::read_block_header(element.data(buf)) {
                    self.record_block(track, relative, flags & 0x80 != 0);
                }
            }
            ids::BLOCK => {
                if let Some((track, relative, _)) = ebml::read_block_header(element.data(buf)) {
                    self.record_block(track, relative, false);
                }
            }
            ids::CUE_POINT => self.flush_pending_cue(),
            ids::CUE_TIME => {
                self.pending_cue.get_or_insert_with(CuePoint::default).time =
                    ebml::read_uint(element.data(buf));
            }
            ids::CUE_TRACK => {
                self.pending_cue.get_or_insert_with(CuePoint::default).track =
                    ebml::read_uint(element.data(buf));
            }
            ids::CUE_CLUSTER_POSITION => {
                self.pending_cue.get_or_insert_with(CuePoint::default).cluster_position =
                    ebml::read_uint(element.data(buf));
            }
            _ => {}
        }

        Ok(())
    }

    fn read_level1(&mut self, element: &Element, buf: &[u8]) -> Result<(), RepairError> {
        if element.id == ids::CLUSTER {
            self.metadata_size = Some(element.tag_start);
            return Ok(());
        }

        let end = element
            .data_end()
            .ok_or(RepairError::UnknownSizedMetadata {
                id: element.id,
                offset: element.tag_start,
            })?;
        self.elements.push(MetadataElement {
            id: element.id,
            bytes: element.raw(buf).to_vec(),
        });
        self.next_level1 = Some(end);
        Ok(())
    }

    fn record_block(&mut self, track: u64, relative: i16, keyframe: bool) {
        let absolute = (self.cluster_timecode as i64 + relative as i64).max(0) as u64;
        self.last_timecode = Some(self.last_timecode.map_or(absolute, |t| t.max(absolute)));

        let Some(cluster_position) = self.cluster_position else {
            return;
        };
        if !keyframe || Some(track) != self.cue_track() {
            return;
        }
        if self.cued_cluster == Some(cluster_position) {
            return;
        }

        self.cued_cluster = Some(cluster_position);
        self.cues.push(CuePoint {
            time: self.cluster_timecode,
            track,
            cluster_position,
        });
    }

    /// The first video track, or the first track when there is no video
    fn cue_track(&self) -> Option<u64> {
        self.tracks
            .iter()
            .find(|t| t.kind == Some(TRACK_TYPE_VIDEO))
            .or_else(|| self.tracks.first())
            .and_then(|t| t.number)
    }

    fn flush_pending_cue(&mut self) {
        if let Some(cue) = self.pending_cue.take() {
            self.indexed_cues.push(cue);
        }
    }

    /// Finish the scan. `total_len` is the length of the scanned buffer.
    pub fn stop(mut self, total_len: usize) -> Result<ScannedMetadata, RepairError> {
        self.flush_pending_cue();

        let ebml_header = self.ebml_header.ok_or(RepairError::NotEbml)?;
        let segment_data_start = self.segment_data_start.ok_or(RepairError::MissingSegment)?;

        Ok(ScannedMetadata {
            ebml_header,
            elements: self.elements,
            cues: self.cues,
            indexed_cues: self.indexed_cues,
            metadata_size: self.metadata_size.unwrap_or(total_len),
            segment_data_start,
            timecode_scale: self.timecode_scale.unwrap_or(DEFAULT_TIMECODE_SCALE),
            duration: self.duration,
            last_timecode: self.last_timecode,
        })
    }
}

/// Decode `buf` and run the whole walk through a [`MetadataReader`]
pub fn scan(buf: &[u8]) -> Result<ScannedMetadata, RepairError> {
    let elements = ebml::decode_all(buf)?;
    match elements.first() {
        Some(first) if first.id == ids::EBML => {}
        _ => return Err(RepairError::NotEbml),
    }

    let mut reader = MetadataReader::new();
    for element in &elements {
        reader.read(element, buf)?;
    }
    reader.stop(buf.len())
}
