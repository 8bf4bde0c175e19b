//! Synthetic recorder output for repair tests

use super::ebml::{self, ids};

pub struct SampleWebm {
    pub bytes: Vec<u8>,
    /// Offset of the first Cluster (length of the leading metadata)
    pub first_cluster: usize,
}

/// Build a stream shaped like live MediaRecorder output: unknown-size
/// Segment and Clusters, no SeekHead, no Duration, no Cues. One VP9 video
/// track (1) and one Opus audio track (2); every cluster opens with a video
/// keyframe followed by an audio block and a video inter frame.
pub fn sample_webm(cluster_times: &[u64]) -> SampleWebm {
    let mut ebml_body = ebml::uint(0x4286, 1); // EBMLVersion
    ebml_body.extend(ebml::uint(0x42F7, 1)); // EBMLReadVersion
    ebml_body.extend(ebml::binary(0x4282, b"webm")); // DocType
    let mut bytes = ebml::master(ids::EBML, &ebml_body);

    ebml::write_unknown_size_header(&mut bytes, ids::SEGMENT);

    let mut info = ebml::uint(ids::TIMECODE_SCALE, ebml::DEFAULT_TIMECODE_SCALE);
    info.extend(ebml::binary(0x4D80, b"Chrome")); // MuxingApp
    info.extend(ebml::binary(0x5741, b"Chrome")); // WritingApp
    bytes.extend(ebml::master(ids::INFO, &info));

    let mut video = ebml::uint(ids::TRACK_NUMBER, 1);
    video.extend(ebml::uint(ids::TRACK_TYPE, 1));
    video.extend(ebml::binary(0x86, b"V_VP9")); // CodecID
    let mut audio = ebml::uint(ids::TRACK_NUMBER, 2);
    audio.extend(ebml::uint(ids::TRACK_TYPE, 2));
    audio.extend(ebml::binary(0x86, b"A_OPUS"));
    let mut tracks = ebml::master(ids::TRACK_ENTRY, &audio);
    tracks.extend(ebml::master(ids::TRACK_ENTRY, &video));
    bytes.extend(ebml::master(ids::TRACKS, &tracks));

    let first_cluster = bytes.len();
    for &time in cluster_times {
        ebml::write_unknown_size_header(&mut bytes, ids::CLUSTER);
        bytes.extend(ebml::uint(ids::TIMECODE, time));
        bytes.extend(ebml::binary(ids::SIMPLE_BLOCK, &[0x81, 0x00, 0x00, 0x80, 0xDE, 0xAD]));
        bytes.extend(ebml::binary(ids::SIMPLE_BLOCK, &[0x82, 0x00, 0x05, 0x80, 0xBE, 0xEF]));
        bytes.extend(ebml::binary(ids::SIMPLE_BLOCK, &[0x81, 0x00, 0x21, 0x00, 0xCA, 0xFE]));
    }

    SampleWebm {
        bytes,
        first_cluster,
    }
}
