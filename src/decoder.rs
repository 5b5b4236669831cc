// Staccato
// Copyright (c) 2025 The Project Staccato Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `decoder` module implements the hierarchical decoder state machine over the bitstream
//! reader: stream, metadata, frame, subframe, residual.

use std::mem;

use log::{debug, warn};

use crate::checksum::{Crc16Ansi, Crc8Ccitt};
use crate::errors::{unsupported_error, Error, Result};
use crate::frame::{
    decode_bits_per_sample, decode_block_size, decode_channel_assignment, decode_sample_rate,
    try_read_coded_ordinal, BlockSequence, BlockingStrategy, ChannelAssignment, FrameHeader,
    FRAME_SYNC_CODE,
};
use crate::io::{BitReader, BitstreamState};
use crate::metadata::{MetadataBlockHeader, MetadataBlockType, StreamInfo, STREAM_INFO_BLOCK_SIZE};
use crate::subframe::{
    decode_subframe_type, restore_left_side, restore_lpc_signal, restore_mid_side,
    restore_right_side, rice_signed_to_i32, shift_channel, SubframeHeader, SubframeType,
    FIXED_COEFFS,
};
use crate::util::bits::sign_extend_leq32_to_i32;

/// The maximum number of channels a FLAC stream can carry.
pub const FLAC_MAX_CHANNEL_COUNT: u8 = 8;

/// The maximum block size in samples a FLAC stream can use.
pub const FLAC_MAX_BLOCK_SIZE: u16 = 65535;

/// The maximum block size a stream in the FLAC Subset format can use.
pub const FLAC_SUBSET_MAX_BLOCK_SIZE: u16 = 16384;

/// The maximum block size a stream in the FLAC Subset format can use at sample rates of 48 kHz
/// and below.
pub const FLAC_SUBSET_MAX_BLOCK_SIZE_48KHZ: u16 = 4608;

/// The maximum order of the linear predictor.
const MAX_LPC_ORDER: usize = 32;

/// The observable state of a [`FlacDecoder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Searching for the `fLaC` stream marker.
    Init,
    /// Inside the chain of metadata blocks.
    InMetadata,
    /// All metadata has been read; the stream information is available.
    EndOfMetadata,
    /// Byte-aligned and scanning for the next frame sync code.
    SearchFrame,
    /// A frame header has been accepted; decoding subframes.
    InFrame,
    /// One block is fully reconstructed and is waiting to be drained by the caller.
    DecodedFrame,
    /// The block has been drained; ready to search for the next frame.
    EndOfFrame,
    /// A permanent failure. Only malformed metadata is fatal; call
    /// [`reset`](FlacDecoder::reset) and start a new stream.
    Error,
}

/// The fine-grained resumption point within the current [`State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PrivState {
    SyncInit,
    SyncF,
    SyncL,
    SyncA,
    MetadataHeader,
    MetadataStreamInfo,
    MetadataSkip,
    FrameSync,
    FrameDesc,
    FrameOrdinal,
    FrameTail,
    FrameCrc,
    SubframeHeader,
    SubframeConstant,
    SubframeVerbatim,
    SubframeWarmup,
    LpcHeader,
    LpcCoeffs,
    ResidualHeader,
    RicePartition,
    RiceUnary,
    RiceRemainder,
    RiceVerbatim,
    RiceNextPartition,
    SubframeFinalize,
    FrameFooter,
}

/// What a call to [`process`](FlacDecoder::process) accomplished.
#[derive(Clone, Copy, Debug)]
pub struct ProcessOutcome {
    /// The state of the decoder when the call returned.
    pub state: State,
    /// The number of bytes consumed from the input slice. Consumed bytes are owned by the
    /// decoder and must not be offered again.
    pub bytes_consumed: usize,
    /// The number of samples written to the output slice.
    pub samples_written: usize,
}

fn check_params(max_block_size: u16, max_channels: u8) -> bool {
    max_block_size > 0 && max_channels > 0 && max_channels <= FLAC_MAX_CHANNEL_COUNT
}

/// Convert a malformed-element error into the matching state transition and bail out of the
/// current step.
macro_rules! try_frame {
    ($self:ident, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(Error::DecodeError(reason)) | Err(Error::Unsupported(reason)) => {
                return $self.recover(reason)
            }
        }
    };
}

/// Free Lossless Audio Codec (FLAC) pull decoder.
///
/// The decoder is driven by the caller through [`process`](FlacDecoder::process) over an
/// arbitrarily fragmented byte stream and produces interleaved linear PCM samples widened to
/// signed 32 bits. All working memory is acquired once at construction and sized by the
/// `(max_block_size, max_channels)` bounds; decoding itself never allocates and never blocks.
pub struct FlacDecoder {
    /// The suspended bitstream window carried between `process` calls.
    bitstream: BitstreamState,
    state: State,
    priv_state: PrivState,
    /// Bytes remaining in the metadata block being read or skipped.
    n_bytes_rem: u32,
    max_block_size: u16,
    max_channels: u8,
    crc8: Crc8Ccitt,
    crc16: Crc16Ansi,
    metadata: MetadataBlockHeader,
    streaminfo: StreamInfo,
    streaminfo_valid: bool,
    frame_header: FrameHeader,
    subframe_header: SubframeHeader,
    /// Quantized LPC coefficients of the subframe being decoded.
    qbuf: [i32; MAX_LPC_ORDER],
    /// Per-channel sample buffers as one slab, `max_block_size` samples per channel.
    slab: Vec<i32>,
    /// Progress cursors, all reset at frame boundaries.
    chan_cur: u8,
    blk_cur: u32,
    coef_cur: u8,
    partition_cur: u32,
    partition_sample: u32,
    rice_unary_counter: u32,
}

impl FlacDecoder {
    /// Returns the total working-set size in bytes of a decoder constructed with the given
    /// bounds, or `None` if either bound is out of range (`max_block_size` must be in
    /// 1..=65535, `max_channels` in 1..=8).
    pub fn required_size(max_block_size: u16, max_channels: u8) -> Option<usize> {
        if !check_params(max_block_size, max_channels) {
            return None;
        }

        let slab = usize::from(max_block_size) * usize::from(max_channels);

        Some(mem::size_of::<FlacDecoder>() + slab * mem::size_of::<i32>())
    }

    /// Instantiate a decoder able to handle streams of up to `max_block_size` samples per
    /// block and up to `max_channels` channels. Frames exceeding either bound are skipped
    /// during decoding.
    ///
    /// For streams in the FLAC Subset format, [`FLAC_SUBSET_MAX_BLOCK_SIZE_48KHZ`] is
    /// sufficient at sample rates up to 48 kHz and [`FLAC_SUBSET_MAX_BLOCK_SIZE`] always is.
    ///
    /// This performs the single allocation of the decoder's lifetime.
    pub fn try_new(max_block_size: u16, max_channels: u8) -> Result<FlacDecoder> {
        if !check_params(max_block_size, max_channels) {
            return unsupported_error("flac: decoder bounds are out of range");
        }

        let slab_len = usize::from(max_block_size) * usize::from(max_channels);

        let mut decoder = FlacDecoder {
            bitstream: BitstreamState::default(),
            state: State::Init,
            priv_state: PrivState::SyncInit,
            n_bytes_rem: 0,
            max_block_size,
            max_channels,
            crc8: Crc8Ccitt::new(0),
            crc16: Crc16Ansi::new(0),
            metadata: MetadataBlockHeader::default(),
            streaminfo: StreamInfo::default(),
            streaminfo_valid: false,
            frame_header: FrameHeader::default(),
            subframe_header: SubframeHeader::default(),
            qbuf: [0; MAX_LPC_ORDER],
            slab: vec![0; slab_len],
            chan_cur: 0,
            blk_cur: 0,
            coef_cur: 0,
            partition_cur: 0,
            partition_sample: 0,
            rice_unary_counter: 0,
        };

        decoder.reset();

        Ok(decoder)
    }

    /// Return the decoder to its initial state to begin a new stream. All scratch state is
    /// cleared; the configured bounds and the sample slab are kept.
    pub fn reset(&mut self) {
        self.bitstream = BitstreamState::default();
        self.state = State::Init;
        self.priv_state = PrivState::SyncInit;
        self.n_bytes_rem = 0;
        self.crc8 = Crc8Ccitt::new(0);
        self.crc16 = Crc16Ansi::new(0);
        self.metadata = MetadataBlockHeader::default();
        self.streaminfo = StreamInfo::default();
        self.streaminfo_valid = false;
        self.frame_header = FrameHeader::default();
        self.subframe_header = SubframeHeader::default();
        self.qbuf = [0; MAX_LPC_ORDER];
        self.chan_cur = 0;
        self.blk_cur = 0;
        self.coef_cur = 0;
        self.partition_cur = 0;
        self.partition_sample = 0;
        self.rice_unary_counter = 0;
    }

    /// The current decoder state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The configured maximum block size in samples per channel.
    pub fn max_block_size(&self) -> u16 {
        self.max_block_size
    }

    /// The configured maximum channel count.
    pub fn max_channels(&self) -> u8 {
        self.max_channels
    }

    /// The stream information of the current stream, available once
    /// [`State::EndOfMetadata`] has been reached.
    pub fn streaminfo(&self) -> Option<&StreamInfo> {
        if self.streaminfo_valid {
            Some(&self.streaminfo)
        }
        else {
            None
        }
    }

    /// Advance the decoder over `input`, interleaving decoded samples into `output`.
    ///
    /// The call returns when the input cannot satisfy the next read, when the output is full,
    /// or when the state machine crosses a caller-visible checkpoint: the stream marker was
    /// found, the metadata ended, a block finished decoding, or a block finished draining.
    /// Passing `None` for `output` silently discards decoded samples.
    ///
    /// The decoder never reads ahead of what it consumes: the reported
    /// [`bytes_consumed`](ProcessOutcome::bytes_consumed) is exact and the remainder of
    /// `input` must be offered again on the next call.
    pub fn process(&mut self, input: &[u8], output: Option<&mut [i32]>) -> ProcessOutcome {
        // A fatal state is sticky and consumes nothing.
        if self.state == State::Error {
            return ProcessOutcome { state: State::Error, bytes_consumed: 0, samples_written: 0 };
        }

        let mut rd = BitReader::resume(self.bitstream, input);
        let mut output = output;
        let mut written = 0;

        let mut visible_state = self.state;

        loop {
            if self.state == State::Error {
                break;
            }

            // Return at the caller-visible checkpoints even if more input could be decoded.
            if visible_state != self.state {
                visible_state = self.state;
                match self.state {
                    State::InMetadata
                    | State::EndOfMetadata
                    | State::DecodedFrame
                    | State::EndOfFrame => break,
                    _ => (),
                }
            }

            let more = match self.state {
                State::Init => self.step_init(&mut rd),
                State::InMetadata => self.step_metadata(&mut rd),
                State::EndOfMetadata | State::EndOfFrame => {
                    self.state = State::SearchFrame;
                    self.priv_state = PrivState::FrameSync;
                    Some(())
                }
                State::SearchFrame => self.step_search_frame(&mut rd),
                State::InFrame => self.step_in_frame(&mut rd),
                State::DecodedFrame => self.step_drain(&mut output, &mut written),
                State::Error => break,
            };

            if more.is_none() {
                break;
            }
        }

        self.bitstream = rd.suspend();

        ProcessOutcome { state: self.state, bytes_consumed: rd.consumed(), samples_written: written }
    }

    /// Handle a malformed element: fatal while reading metadata, otherwise resynchronize on
    /// the next frame sync code.
    ///
    /// The return value feeds the `process` loop: `None` stops it (fatal), `Some` lets it
    /// carry on with the sync hunt.
    fn recover(&mut self, reason: &'static str) -> Option<()> {
        if matches!(self.state, State::Init | State::InMetadata) {
            warn!("{}", reason);
            self.state = State::Error;
            return None;
        }

        warn!("{}; resynchronizing", reason);
        self.state = State::SearchFrame;
        self.priv_state = PrivState::FrameSync;
        Some(())
    }

    /// Base index of the current channel's buffer within the slab.
    fn channel_base(&self) -> usize {
        usize::from(self.chan_cur) * usize::from(self.max_block_size)
    }

    /// Byte-wise matcher for the `fLaC` stream marker. A mismatch restarts the pattern, which
    /// skips ID3 tags or other prefaces that do not themselves contain the marker.
    fn step_init(&mut self, rd: &mut BitReader<'_>) -> Option<()> {
        let byte = rd.try_read(8)? as u8;

        self.priv_state = match (self.priv_state, byte) {
            (PrivState::SyncInit, b'f') => PrivState::SyncF,
            (PrivState::SyncF, b'L') => PrivState::SyncL,
            (PrivState::SyncL, b'a') => PrivState::SyncA,
            (PrivState::SyncA, b'C') => {
                debug!("found fLaC stream marker");
                self.state = State::InMetadata;
                PrivState::MetadataHeader
            }
            _ => PrivState::SyncInit,
        };

        Some(())
    }

    fn step_metadata(&mut self, rd: &mut BitReader<'_>) -> Option<()> {
        match self.priv_state {
            PrivState::MetadataHeader => {
                if !rd.can_read(32) {
                    return None;
                }

                let is_last = rd.try_read(1)? == 1;
                let block_type = MetadataBlockType::from_id(rd.try_read(7)? as u8);
                let length = rd.try_read(24)? as u32;

                self.metadata = MetadataBlockHeader { is_last, block_type };
                self.n_bytes_rem = length;

                match self.metadata.block_type {
                    MetadataBlockType::Invalid => {
                        return self.recover("flac: metadata block type is invalid");
                    }
                    MetadataBlockType::StreamInfo => {
                        if length != STREAM_INFO_BLOCK_SIZE {
                            return self
                                .recover("flac: stream information block has wrong length");
                        }
                        self.priv_state = PrivState::MetadataStreamInfo;
                    }
                    MetadataBlockType::Unknown(id) => {
                        debug!("skipping unknown metadata block type {}", id);
                        self.priv_state = PrivState::MetadataSkip;
                    }
                    _ => self.priv_state = PrivState::MetadataSkip,
                }
            }
            // The stream information fields are consumed in runs that fit the read budget,
            // keyed on the bytes remaining so a starved run resumes where it left off.
            PrivState::MetadataStreamInfo => match self.n_bytes_rem {
                34 => {
                    self.streaminfo.min_block_size = rd.try_read(16)? as u16;
                    self.n_bytes_rem -= 2;
                }
                32 => {
                    self.streaminfo.max_block_size = rd.try_read(16)? as u16;
                    self.n_bytes_rem -= 2;
                }
                30 => {
                    self.streaminfo.min_frame_size = rd.try_read(24)? as u32;
                    self.n_bytes_rem -= 3;
                }
                27 => {
                    self.streaminfo.max_frame_size = rd.try_read(24)? as u32;
                    self.n_bytes_rem -= 3;
                }
                24 => {
                    if !rd.can_read(28) {
                        return None;
                    }
                    self.streaminfo.sample_rate = rd.try_read(20)? as u32;
                    self.streaminfo.channel_count = rd.try_read(3)? as u8 + 1;
                    self.streaminfo.bits_per_sample = rd.try_read(5)? as u32 + 1;
                    self.n_bytes_rem -= 4;
                }
                20 => {
                    self.streaminfo.n_samples = rd.try_read(36)?;
                    self.n_bytes_rem -= 4;
                }
                1..=16 => {
                    self.streaminfo.md5[16 - self.n_bytes_rem as usize] = rd.try_read(8)? as u8;
                    self.n_bytes_rem -= 1;
                }
                0 => self.priv_state = PrivState::MetadataSkip,
                _ => return self.recover("flac: decoder state is corrupt"),
            },
            PrivState::MetadataSkip => {
                // Skip in runs of at most 7 bytes to stay within the read budget.
                let n_read = self.n_bytes_rem.min(7);

                if n_read == 0 {
                    if self.metadata.is_last {
                        let si = &self.streaminfo;
                        debug!(
                            "streaminfo: {} Hz, {} channels, {} bits per sample, blocks of {}..={}",
                            si.sample_rate,
                            si.channel_count,
                            si.bits_per_sample,
                            si.min_block_size,
                            si.max_block_size,
                        );
                        self.streaminfo_valid = true;
                        self.state = State::EndOfMetadata;
                    }
                    else {
                        self.priv_state = PrivState::MetadataHeader;
                    }
                }
                else {
                    rd.try_read(8 * n_read)?;
                    self.n_bytes_rem -= n_read;
                }
            }
            _ => return self.recover("flac: decoder state is corrupt"),
        }

        Some(())
    }

    fn step_search_frame(&mut self, rd: &mut BitReader<'_>) -> Option<()> {
        match self.priv_state {
            PrivState::FrameSync => {
                // Synchronize with the underlying byte stream; frames are byte-aligned.
                let align = rd.bits_until_aligned();
                if align > 0 {
                    rd.try_read(align)?;
                }

                if rd.try_peek(15)? != FRAME_SYNC_CODE {
                    rd.try_read(8)?;
                    return Some(());
                }

                // Both checksum trails start at the first sync byte.
                self.crc8 = Crc8Ccitt::new(0);
                self.crc16 = Crc16Ansi::new(0);
                self.priv_state = PrivState::FrameDesc;
                rd.try_read_with(15, &mut (&mut self.crc8, &mut self.crc16))?;
            }
            PrivState::FrameDesc => {
                if !rd.can_read(17) {
                    return None;
                }

                let mut dcrc = (&mut self.crc8, &mut self.crc16);
                let blocking = rd.try_read_with(1, &mut dcrc)?;
                let block_size_enc = rd.try_read_with(4, &mut dcrc)? as u32;
                let sample_rate_enc = rd.try_read_with(4, &mut dcrc)? as u32;
                let channels_enc = rd.try_read_with(4, &mut dcrc)? as u32;
                let bps_enc = rd.try_read_with(3, &mut dcrc)? as u32;
                let reserved = rd.try_read_with(1, &mut dcrc)?;

                if reserved != 0 {
                    return self.recover("flac: frame header reserved bit is not zero");
                }

                let blocking_strategy = match blocking {
                    0 => BlockingStrategy::Fixed,
                    _ => BlockingStrategy::Variable,
                };

                let channel_assignment = try_frame!(self, decode_channel_assignment(channels_enc));
                let block_size = try_frame!(self, decode_block_size(block_size_enc));
                let sample_rate =
                    try_frame!(self, decode_sample_rate(sample_rate_enc, self.streaminfo.sample_rate));
                let bits_per_sample =
                    try_frame!(self, decode_bits_per_sample(bps_enc, self.streaminfo.bits_per_sample));

                self.frame_header = FrameHeader {
                    blocking_strategy,
                    block_sequence: BlockSequence::ByFrame(0),
                    channel_assignment,
                    channel_count: channel_assignment.channel_count(),
                    block_size,
                    sample_rate,
                    bits_per_sample,
                    block_size_enc,
                    sample_rate_enc,
                };
                self.priv_state = PrivState::FrameOrdinal;
            }
            PrivState::FrameOrdinal => {
                let max_len = match self.frame_header.blocking_strategy {
                    BlockingStrategy::Fixed => 6,
                    BlockingStrategy::Variable => 7,
                };

                let mut dcrc = (&mut self.crc8, &mut self.crc16);
                let ordinal = try_read_coded_ordinal(rd, max_len, &mut dcrc)?;
                let ordinal = try_frame!(self, ordinal);

                self.frame_header.block_sequence = match self.frame_header.blocking_strategy {
                    BlockingStrategy::Fixed => BlockSequence::ByFrame(ordinal as u32),
                    BlockingStrategy::Variable => BlockSequence::BySample(ordinal),
                };
                self.priv_state = PrivState::FrameTail;
            }
            PrivState::FrameTail => {
                if !rd.can_read(32) {
                    return None;
                }

                // Read the block size and sample rate values that were not packed into the
                // description field.
                let mut dcrc = (&mut self.crc8, &mut self.crc16);

                match self.frame_header.block_size_enc {
                    0x6 => self.frame_header.block_size = 1 + rd.try_read_with(8, &mut dcrc)? as u32,
                    0x7 => self.frame_header.block_size = 1 + rd.try_read_with(16, &mut dcrc)? as u32,
                    _ => (),
                }

                match self.frame_header.sample_rate_enc {
                    0xc => self.frame_header.sample_rate = 1000 * rd.try_read_with(8, &mut dcrc)? as u32,
                    0xd => self.frame_header.sample_rate = rd.try_read_with(16, &mut dcrc)? as u32,
                    0xe => self.frame_header.sample_rate = 10 * rd.try_read_with(16, &mut dcrc)? as u32,
                    _ => (),
                }

                self.priv_state = PrivState::FrameCrc;
            }
            PrivState::FrameCrc => {
                // The trailing CRC-8 byte covers the header but feeds the frame CRC-16 only.
                let crc8_computed = self.crc8.crc();
                let crc8_expected = rd.try_read_with(8, &mut self.crc16)? as u8;

                if cfg!(feature = "check-crc") && crc8_expected != crc8_computed {
                    return self.recover("flac: computed frame header CRC does not match");
                }

                if self.frame_header.block_size > u32::from(self.max_block_size)
                    || self.frame_header.channel_count > self.max_channels
                {
                    return self.recover("flac: frame exceeds the configured decoder bounds");
                }

                let fh = &self.frame_header;
                debug!(
                    "frame: [{:?}] block_size={}, channels={:?}, rate={}, bps={}",
                    fh.block_sequence,
                    fh.block_size,
                    fh.channel_assignment,
                    fh.sample_rate,
                    fh.bits_per_sample,
                );

                self.state = State::InFrame;
                self.priv_state = PrivState::SubframeHeader;
                self.chan_cur = 0;
            }
            _ => return self.recover("flac: decoder state is corrupt"),
        }

        Some(())
    }

    fn step_in_frame(&mut self, rd: &mut BitReader<'_>) -> Option<()> {
        match self.priv_state {
            PrivState::SubframeHeader => {
                // The whole header, including a maximal wasted-bits run, fits the read budget;
                // reserving it up front keeps the header parse atomic.
                if !rd.can_read(40) {
                    return None;
                }

                // Reset the write cursor for this channel.
                self.blk_cur = 0;

                let padding = rd.try_read_with(1, &mut self.crc16)?;
                let type_enc = rd.try_read_with(6, &mut self.crc16)? as u32;
                let (sf_type, order) = try_frame!(self, decode_subframe_type(type_enc));

                let mut wasted_bits = 0;
                if rd.try_read_with(1, &mut self.crc16)? == 1 {
                    // Unary coded, capped at 30. If no terminator shows up within the cap the
                    // count saturates at one; such a frame cannot pass its checksum anyway.
                    wasted_bits = 1;
                    for i in 1..=30 {
                        if rd.try_read_with(1, &mut self.crc16)? == 1 {
                            wasted_bits = i;
                            break;
                        }
                    }
                }

                if padding != 0 {
                    return self.recover("flac: subframe padding is not zero");
                }

                let frame_bps = self.frame_header.bits_per_sample;
                let is_side =
                    self.frame_header.channel_assignment.is_side_channel(self.chan_cur);

                if wasted_bits > 0 && wasted_bits >= frame_bps {
                    return self.recover("flac: subframe wasted bits exceed the sample size");
                }

                if self.frame_header.block_size < u32::from(order) {
                    return self.recover("flac: subframe order exceeds the block size");
                }

                // The effective coded width: the difference channel of a decorrelated stereo
                // frame carries one extra bit.
                let mut bits_per_sample = frame_bps - wasted_bits;
                if is_side {
                    bits_per_sample += 1;
                }

                if bits_per_sample == 0 || bits_per_sample > 32 {
                    return self.recover("flac: subframe bits per sample are out of bounds");
                }

                self.subframe_header = SubframeHeader {
                    sf_type,
                    order,
                    wasted_bits,
                    bits_per_sample,
                    ..Default::default()
                };

                self.priv_state = match sf_type {
                    SubframeType::Constant => PrivState::SubframeConstant,
                    SubframeType::Verbatim => PrivState::SubframeVerbatim,
                    SubframeType::Fixed | SubframeType::Lpc => PrivState::SubframeWarmup,
                };
            }
            PrivState::SubframeConstant => {
                let bps = self.subframe_header.bits_per_sample;
                let value = rd.try_read_with(bps, &mut self.crc16)?;
                let sample = sign_extend_leq32_to_i32(value as u32, bps);

                let base = self.channel_base();
                let block_size = self.frame_header.block_size as usize;
                for s in self.slab[base..base + block_size].iter_mut() {
                    *s = sample;
                }

                self.priv_state = PrivState::SubframeFinalize;
            }
            PrivState::SubframeVerbatim | PrivState::SubframeWarmup => {
                // Read either the entire block or just the predictor warm-up samples.
                let bps = self.subframe_header.bits_per_sample;
                let n_samples = match self.subframe_header.sf_type {
                    SubframeType::Verbatim => self.frame_header.block_size,
                    _ => u32::from(self.subframe_header.order),
                };

                let base = self.channel_base();
                while self.blk_cur < n_samples {
                    let value = rd.try_read_with(bps, &mut self.crc16)?;
                    self.slab[base + self.blk_cur as usize] =
                        sign_extend_leq32_to_i32(value as u32, bps);
                    self.blk_cur += 1;
                }

                self.priv_state = match self.subframe_header.sf_type {
                    SubframeType::Verbatim => PrivState::SubframeFinalize,
                    SubframeType::Lpc => PrivState::LpcHeader,
                    _ => PrivState::ResidualHeader,
                };
            }
            PrivState::LpcHeader => {
                if !rd.can_read(9) {
                    return None;
                }

                let precision_enc = rd.try_read_with(4, &mut self.crc16)? as u32;
                let shift_enc = rd.try_read_with(5, &mut self.crc16)? as u32;

                if precision_enc == 15 {
                    return self.recover("flac: lpc precision set to reserved value");
                }

                let shift = sign_extend_leq32_to_i32(shift_enc, 5);
                if shift < 0 {
                    return self.recover("flac: lpc shift is negative");
                }

                self.subframe_header.lpc_precision = precision_enc + 1;
                self.subframe_header.lpc_shift = shift as u32;
                self.coef_cur = 0;
                self.priv_state = PrivState::LpcCoeffs;
            }
            PrivState::LpcCoeffs => {
                let precision = self.subframe_header.lpc_precision;
                let order = self.subframe_header.order;

                while self.coef_cur < order {
                    let coeff = rd.try_read_with(precision, &mut self.crc16)?;
                    self.qbuf[usize::from(self.coef_cur)] =
                        sign_extend_leq32_to_i32(coeff as u32, precision);
                    self.coef_cur += 1;
                }

                self.priv_state = PrivState::ResidualHeader;
            }
            PrivState::ResidualHeader => {
                if !rd.can_read(6) {
                    return None;
                }

                let method = rd.try_read_with(2, &mut self.crc16)?;
                if method > 1 {
                    return self.recover("flac: residual method set to reserved value");
                }

                self.subframe_header.rice_param_width = if method == 0 { 4 } else { 5 };
                self.subframe_header.rice_partition_order =
                    rd.try_read_with(4, &mut self.crc16)? as u32;
                self.partition_cur = 0;
                self.priv_state = PrivState::RicePartition;
            }
            PrivState::RicePartition => {
                if !rd.can_read(10) {
                    return None;
                }

                let width = self.subframe_header.rice_param_width;
                let parameter = rd.try_read_with(width, &mut self.crc16)? as u32;

                if parameter == (1 << width) - 1 {
                    // An all-ones parameter escapes to a fixed-width binary partition; the
                    // width follows.
                    self.subframe_header.rice_parameter =
                        rd.try_read_with(5, &mut self.crc16)? as u32;
                    self.priv_state = PrivState::RiceVerbatim;
                }
                else {
                    self.subframe_header.rice_parameter = parameter;
                    self.rice_unary_counter = 0;
                    self.priv_state = PrivState::RiceUnary;
                }

                let block_size = self.frame_header.block_size;
                let mut n_samples = block_size >> self.subframe_header.rice_partition_order;

                if self.partition_cur == 0 {
                    // The first partition also carries the warm-up samples.
                    if n_samples < u32::from(self.subframe_header.order) {
                        return self
                            .recover("flac: residual partition is smaller than the predictor order");
                    }
                    n_samples -= u32::from(self.subframe_header.order);
                }

                if self.blk_cur + n_samples > block_size {
                    return self.recover("flac: residual partitions exceed the block size");
                }

                self.partition_sample = n_samples;
            }
            PrivState::RiceUnary | PrivState::RiceRemainder => {
                let parameter = self.subframe_header.rice_parameter;
                let base = self.channel_base();

                while self.partition_sample > 0 {
                    if self.priv_state == PrivState::RiceUnary {
                        rd.try_read_unary_zeros_with(
                            &mut self.rice_unary_counter,
                            &mut self.crc16,
                        )?;
                    }

                    // If the remainder read starves, resume here without re-reading the
                    // quotient.
                    self.priv_state = PrivState::RiceRemainder;

                    let mut remainder = 0;
                    if parameter > 0 {
                        remainder = rd.try_read_with(parameter, &mut self.crc16)? as u32;
                    }

                    let value = self.rice_unary_counter.wrapping_shl(parameter) | remainder;
                    self.slab[base + self.blk_cur as usize] = rice_signed_to_i32(value);

                    self.rice_unary_counter = 0;
                    self.priv_state = PrivState::RiceUnary;
                    self.blk_cur += 1;
                    self.partition_sample -= 1;
                }

                self.priv_state = PrivState::RiceNextPartition;
            }
            PrivState::RiceVerbatim => {
                // The escape width replaces the Rice parameter for this partition.
                let width = self.subframe_header.rice_parameter;
                let base = self.channel_base();

                while self.partition_sample > 0 {
                    let sample = if width == 0 {
                        0
                    }
                    else {
                        let value = rd.try_read_with(width, &mut self.crc16)?;
                        sign_extend_leq32_to_i32(value as u32, width)
                    };

                    self.slab[base + self.blk_cur as usize] = sample;
                    self.blk_cur += 1;
                    self.partition_sample -= 1;
                }

                self.priv_state = PrivState::RiceNextPartition;
            }
            PrivState::RiceNextPartition => {
                self.partition_cur += 1;

                if self.partition_cur == 1 << self.subframe_header.rice_partition_order {
                    // All residuals are in place; run the predictor over the block.
                    let base = self.channel_base();
                    let block_size = self.frame_header.block_size as usize;
                    let sfh = &self.subframe_header;
                    let order = usize::from(sfh.order);
                    let buf = &mut self.slab[base..base + block_size];

                    match sfh.sf_type {
                        SubframeType::Fixed => {
                            restore_lpc_signal(buf, &FIXED_COEFFS[order][..order], 0)
                        }
                        _ => restore_lpc_signal(buf, &self.qbuf[..order], sfh.lpc_shift),
                    }

                    self.priv_state = PrivState::SubframeFinalize;
                }
                else {
                    self.priv_state = PrivState::RicePartition;
                }
            }
            PrivState::SubframeFinalize => {
                // Undo the wasted-bits truncation, then move to the next channel.
                let base = self.channel_base();
                let block_size = self.frame_header.block_size as usize;
                shift_channel(&mut self.slab, base, block_size, self.subframe_header.wasted_bits);

                self.chan_cur += 1;
                self.priv_state = if self.chan_cur < self.frame_header.channel_count {
                    PrivState::SubframeHeader
                }
                else {
                    PrivState::FrameFooter
                };
            }
            PrivState::FrameFooter => {
                // The padding bits up to the byte boundary still belong to the CRC-16 trail;
                // the 16-bit trailer itself does not.
                let align = rd.bits_until_aligned();
                if align > 0 {
                    rd.try_read_with(align, &mut self.crc16)?;
                }

                let crc16_computed = self.crc16.crc();
                let crc16_expected = rd.try_read(16)? as u16;

                if cfg!(feature = "check-crc") && crc16_expected != crc16_computed {
                    return self.recover("flac: computed frame CRC does not match");
                }

                let fh = &self.frame_header;
                let block_size = fh.block_size as usize;
                let stride = usize::from(self.max_block_size);

                // Channel 0 sits at the head of the slab, channel 1 one stride later.
                if fh.channel_count == 2 {
                    match fh.channel_assignment {
                        ChannelAssignment::LeftSide => {
                            restore_left_side(&mut self.slab, 0, stride, block_size)
                        }
                        ChannelAssignment::RightSide => {
                            restore_right_side(&mut self.slab, 0, stride, block_size)
                        }
                        ChannelAssignment::MidSide => {
                            restore_mid_side(&mut self.slab, 0, stride, block_size)
                        }
                        ChannelAssignment::Independent(_) => (),
                    }
                }

                // Widen every channel so the output always spans the signed 32-bit range,
                // whatever the stream's sample size.
                let shift = 32 - fh.bits_per_sample;
                for channel in 0..usize::from(fh.channel_count) {
                    shift_channel(&mut self.slab, channel * stride, block_size, shift);
                }

                self.blk_cur = 0;
                self.chan_cur = 0;
                self.state = State::DecodedFrame;
            }
            _ => {
                // An inconsistent resumption point is an internal invariant violation.
                warn!("flac: decoder state is corrupt");
                self.state = State::Error;
                return None;
            }
        }

        Some(())
    }

    /// Interleave the reconstructed block into the caller's output, sample-major and
    /// channel-minor, resuming from the drain cursors.
    fn step_drain(
        &mut self,
        output: &mut Option<&mut [i32]>,
        written: &mut usize,
    ) -> Option<()> {
        let out = match output {
            Some(out) => &mut **out,
            // Without an output buffer the block is discarded.
            None => {
                self.state = State::EndOfFrame;
                return Some(());
            }
        };

        let channel_count = u32::from(self.frame_header.channel_count);
        let block_size = self.frame_header.block_size;
        let stride = usize::from(self.max_block_size);

        // Samples left in the block, truncated to the space left in the output.
        let remaining = (block_size - self.blk_cur - 1) * channel_count
            + (channel_count - u32::from(self.chan_cur));
        let writable = (remaining as usize).min(out.len() - *written);

        for slot in out[*written..*written + writable].iter_mut() {
            *slot = self.slab[usize::from(self.chan_cur) * stride + self.blk_cur as usize];

            self.chan_cur += 1;
            if u32::from(self.chan_cur) == channel_count {
                self.chan_cur = 0;
                self.blk_cur += 1;
            }
        }

        *written += writable;

        if self.blk_cur == block_size {
            self.state = State::EndOfFrame;
            return Some(());
        }

        // The output is full; hand control back to the caller.
        None
    }
}
