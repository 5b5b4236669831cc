// Staccato
// Copyright (c) 2025 The Project Staccato Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `metadata` module defines the metadata block structures of a FLAC stream.

/// The length in bytes of a stream information block, the only length the block is permitted to
/// have.
pub(crate) const STREAM_INFO_BLOCK_SIZE: u32 = 34;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataBlockType {
    StreamInfo,
    Padding,
    Application,
    SeekTable,
    VorbisComment,
    Cuesheet,
    Picture,
    Unknown(u8),
    /// Block type 127 is forbidden by the format.
    Invalid,
}

impl MetadataBlockType {
    pub fn from_id(id: u8) -> MetadataBlockType {
        match id {
            0 => MetadataBlockType::StreamInfo,
            1 => MetadataBlockType::Padding,
            2 => MetadataBlockType::Application,
            3 => MetadataBlockType::SeekTable,
            4 => MetadataBlockType::VorbisComment,
            5 => MetadataBlockType::Cuesheet,
            6 => MetadataBlockType::Picture,
            127 => MetadataBlockType::Invalid,
            _ => MetadataBlockType::Unknown(id),
        }
    }
}

/// A metadata block header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MetadataBlockHeader {
    /// Set if this metadata block is the last in the stream.
    pub is_last: bool,
    /// The type of the metadata block.
    pub block_type: MetadataBlockType,
}

impl Default for MetadataBlockHeader {
    fn default() -> Self {
        MetadataBlockHeader { is_last: false, block_type: MetadataBlockType::Invalid }
    }
}

/// The fields of a stream information (STREAMINFO) block.
///
/// Valid once the decoder has reached [`State::EndOfMetadata`](crate::State::EndOfMetadata) for
/// the first time.
#[derive(Clone, Debug, Default)]
pub struct StreamInfo {
    /// The minimum and maximum number of decoded samples per channel per block.
    pub min_block_size: u16,
    pub max_block_size: u16,
    /// The minimum and maximum byte length of an encoded frame. Either value may be 0 if
    /// unknown.
    pub min_frame_size: u32,
    pub max_frame_size: u32,
    /// The sample rate in Hz, or 0 if not stated.
    pub sample_rate: u32,
    /// The number of channels (1 to 8).
    pub channel_count: u8,
    /// The number of bits per sample (4 to 32).
    pub bits_per_sample: u32,
    /// The total number of samples per channel in the stream, or 0 if unknown.
    pub n_samples: u64,
    /// The MD5 digest of the decoded audio. All zeros if no digest is present.
    pub md5: [u8; 16],
}
