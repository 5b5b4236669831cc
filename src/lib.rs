// Staccato
// Copyright (c) 2025 The Project Staccato Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Staccato is a pull-based decoder for the Free Lossless Audio Codec (FLAC) bitstream.
//!
//! The decoder consumes raw FLAC data (the `fLaC` marker, a chain of metadata blocks, and a
//! sequence of audio frames) and produces interleaved linear PCM samples widened to signed
//! 32-bit integers, left-aligned to the stream's sample depth. The caller recovers the native
//! depth with an arithmetic right shift by `32 - bits_per_sample`.
//!
//! It is built for memory-constrained, latency-sensitive embedders: all working memory is
//! allocated once at construction and bounded by the configured maximum block size and channel
//! count, [`process`](FlacDecoder::process) never blocks and never allocates, and input may be
//! fragmented arbitrarily, down to one byte per call. Damaged frames are skipped by
//! resynchronizing on the next frame boundary; only malformed metadata is fatal.
//!
//! ```no_run
//! use staccato::{FlacDecoder, State};
//!
//! let mut decoder = FlacDecoder::try_new(4608, 2).unwrap();
//!
//! let mut input: &[u8] = &[/* raw FLAC bytes */];
//! let mut samples = [0i32; 4096];
//!
//! while !input.is_empty() {
//!     let outcome = decoder.process(input, Some(&mut samples));
//!     input = &input[outcome.bytes_consumed..];
//!
//!     if outcome.state == State::Error {
//!         break;
//!     }
//!
//!     // Hand &samples[..outcome.samples_written] to the audio sink.
//! }
//! ```

pub mod checksum;
pub mod errors;
pub mod io;
pub mod util;

mod decoder;
mod frame;
mod metadata;
mod subframe;

pub use decoder::{
    FlacDecoder, ProcessOutcome, State, FLAC_MAX_BLOCK_SIZE, FLAC_MAX_CHANNEL_COUNT,
    FLAC_SUBSET_MAX_BLOCK_SIZE, FLAC_SUBSET_MAX_BLOCK_SIZE_48KHZ,
};
pub use frame::{BlockSequence, BlockingStrategy, ChannelAssignment};
pub use metadata::StreamInfo;
