//! Where each request's audio tokens sit inside the packed batch.
//!
//! The packed batch has no separators. For request `i` with conditioning
//! length `c_i` and total length `s_i`:
//!
//! ```text
//! start_0 = c_0                 end_0 = s_0
//! start_i = end_{i-1} + c_i     end_i = end_{i-1} + s_i
//! ```
//!
//! so `[start_i, end_i)` is the audio-token span of request `i`, and
//! `[end_{i-1}, start_i)` is its already consumed conditioning prefix.

use std::ops::Range;

use crate::error::{ModelError, Result};
use crate::multimodal::Conditioning;

/// Audio-token span of one request in packed coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOffsets {
    pub start: usize,
    pub end: usize,
}

impl RequestOffsets {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Per-request offsets for a heterogeneous batch, recomputed every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    entries: Vec<RequestOffsets>,
}

impl OffsetTable {
    /// Build the table from conditioning lengths and total sequence lengths.
    pub fn new(conditioning_lens: &[usize], seq_lens: &[usize]) -> Result<Self> {
        if conditioning_lens.len() != seq_lens.len() {
            return Err(ModelError::ConditioningCount {
                conditioning: conditioning_lens.len(),
                sequences: seq_lens.len(),
            });
        }

        let mut entries = Vec::with_capacity(seq_lens.len());
        let mut base = 0;
        for (&c, &s) in conditioning_lens.iter().zip(seq_lens) {
            if c > s {
                return Err(ModelError::OffsetMismatch {
                    covered: base + c,
                    expected: base + s,
                });
            }
            entries.push(RequestOffsets {
                start: base + c,
                end: base + s,
            });
            base += s;
        }

        let table = Self { entries };
        let audio_rows: usize = seq_lens.iter().sum::<usize>() - conditioning_lens.iter().sum::<usize>();
        if table.audio_rows() != audio_rows {
            return Err(ModelError::OffsetMismatch {
                covered: table.audio_rows(),
                expected: audio_rows,
            });
        }
        Ok(table)
    }

    pub fn entries(&self) -> &[RequestOffsets] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Audio-token rows summed over all requests.
    pub fn audio_rows(&self) -> usize {
        self.entries.iter().map(RequestOffsets::len).sum()
    }

    /// Packed rows the table spans, conditioning included.
    pub fn packed_len(&self) -> usize {
        self.entries.last().map_or(0, |e| e.end)
    }

    /// Length of each request's audio-token span, in batch order.
    pub fn split_sizes(&self) -> Vec<usize> {
        self.entries.iter().map(RequestOffsets::len).collect()
    }
}

/// How to find audio tokens in the packed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alignment {
    /// Homogeneous batch: every row at or past `offset` is an audio token.
    Single { offset: usize },
    PerRequest(OffsetTable),
}

/// Align `conditioning` against a packed batch of `packed_len` rows laid out
/// as `seq_lens`.
///
/// A layout that does not account for exactly `packed_len` rows is a
/// scheduler/conditioning mismatch and fails the call.
pub fn align(conditioning: &Conditioning, seq_lens: &[usize], packed_len: usize) -> Result<Alignment> {
    match conditioning {
        Conditioning::Single(_) => {
            let offset = conditioning.row_counts()?[0];
            if offset > packed_len {
                return Err(ModelError::OffsetMismatch {
                    covered: offset,
                    expected: packed_len,
                });
            }
            Ok(Alignment::Single { offset })
        }
        Conditioning::PerRequest(_) => {
            let table = OffsetTable::new(&conditioning.row_counts()?, seq_lens)?;
            if table.packed_len() != packed_len {
                return Err(ModelError::OffsetMismatch {
                    covered: table.packed_len(),
                    expected: packed_len,
                });
            }
            Ok(Alignment::PerRequest(table))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn cond(rows: &[usize]) -> Conditioning {
        Conditioning::PerRequest(
            rows.iter()
                .map(|&r| Tensor::zeros((r, 4), DType::F32, &Device::Cpu).unwrap())
                .collect(),
        )
    }

    #[test]
    fn two_request_example() {
        let table = OffsetTable::new(&[3, 2], &[5, 4]).unwrap();
        assert_eq!(
            table.entries(),
            &[
                RequestOffsets { start: 3, end: 5 },
                RequestOffsets { start: 7, end: 9 },
            ]
        );
        assert_eq!(table.split_sizes(), vec![2, 2]);
        assert_eq!(table.audio_rows(), (5 - 3) + (4 - 2));
        assert_eq!(table.packed_len(), 9);
    }

    #[test]
    fn span_lengths_match_sequence_minus_conditioning() {
        let c = [4, 0, 7, 1, 3];
        let s = [9, 2, 7, 5, 10];
        let table = OffsetTable::new(&c, &s).unwrap();
        for (i, e) in table.entries().iter().enumerate() {
            assert_eq!(e.len(), s[i] - c[i]);
            assert!(e.start <= e.end);
        }
        let total: usize = s.iter().sum::<usize>() - c.iter().sum::<usize>();
        assert_eq!(table.audio_rows(), total);
    }

    #[test]
    fn zero_conditioning_starts_at_previous_end() {
        let table = OffsetTable::new(&[2, 0, 1], &[4, 3, 2]).unwrap();
        let e = table.entries();
        assert_eq!(e[1], RequestOffsets { start: e[0].end, end: e[0].end + 3 });
        assert_eq!(e[2], RequestOffsets { start: 8, end: 9 });
    }

    #[test]
    fn conditioning_longer_than_sequence_is_fatal() {
        assert!(matches!(
            OffsetTable::new(&[3, 6], &[5, 4]),
            Err(ModelError::OffsetMismatch { covered: 11, expected: 9 })
        ));
    }

    #[test]
    fn count_mismatch_is_fatal() {
        assert!(matches!(
            OffsetTable::new(&[3], &[5, 4]),
            Err(ModelError::ConditioningCount { conditioning: 1, sequences: 2 })
        ));
    }

    #[test]
    fn align_checks_packed_length() {
        let c = cond(&[3, 2]);
        assert!(matches!(align(&c, &[5, 4], 9), Ok(Alignment::PerRequest(_))));
        assert!(matches!(
            align(&c, &[5, 4], 10),
            Err(ModelError::OffsetMismatch { covered: 9, expected: 10 })
        ));
    }

    #[test]
    fn single_tensor_offset_is_its_row_count() {
        let c = Conditioning::Single(Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap());
        assert_eq!(align(&c, &[5], 5).unwrap(), Alignment::Single { offset: 3 });
        assert!(align(&c, &[2], 2).is_err());
    }

    #[test]
    fn round_trip_recovers_audio_tokens() {
        // Pack [placeholder_i, audio_i] per request and slice it back out.
        let audio: Vec<Vec<u32>> = vec![vec![10, 11], vec![], vec![20, 21, 22]];
        let cond_lens = [3usize, 1, 0];
        let mut packed = Vec::new();
        let mut seq_lens = Vec::new();
        for (a, &c) in audio.iter().zip(&cond_lens) {
            packed.extend(std::iter::repeat(0u32).take(c));
            packed.extend(a);
            seq_lens.push(c + a.len());
        }
        let table = OffsetTable::new(&cond_lens, &seq_lens).unwrap();
        for (e, a) in table.entries().iter().zip(&audio) {
            assert_eq!(&packed[e.range()], a.as_slice());
        }
    }
}
