use std::collections::BTreeMap;

use bytes::Bytes;

use crate::transport_error::TransportError;

/// Reassembles the ordered byte stream carried by CRYPTO frames
///
/// Frames may arrive out of order and overlapping; the handshake driver only ever sees
/// contiguous bytes, in order, exactly once. Out-of-order data is buffered up to a
/// caller-supplied bound.
pub(crate) struct Assembler {
    /// Offset of the next byte to deliver
    offset: u64,
    /// Buffered segments, keyed by their start offset
    segments: BTreeMap<u64, Bytes>,
    buffered: usize,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self {
            offset: 0,
            segments: BTreeMap::new(),
            buffered: 0,
        }
    }

    /// Buffer a segment received at `offset`
    pub(crate) fn insert(
        &mut self,
        mut offset: u64,
        mut data: Bytes,
        max_buffered: usize,
    ) -> Result<(), TransportError> {
        // Discard data we have already delivered
        if offset < self.offset {
            let already = (self.offset - offset).min(data.len() as u64) as usize;
            data.advance_checked(already);
            offset = self.offset;
        }
        if data.is_empty() {
            return Ok(());
        }

        // Trim against buffered segments that already cover a prefix of this one
        if let Some((&start, existing)) = self.segments.range(..=offset).next_back() {
            let end = start + existing.len() as u64;
            if end >= offset + data.len() as u64 {
                return Ok(());
            }
            if end > offset {
                data.advance_checked((end - offset) as usize);
                offset = end;
            }
        }
        // Drop buffered segments this one wholly covers
        let covered: Vec<u64> = self
            .segments
            .range(offset..offset + data.len() as u64)
            .filter(|&(&start, seg)| start + seg.len() as u64 <= offset + data.len() as u64)
            .map(|(&start, _)| start)
            .collect();
        for start in covered {
            if let Some(seg) = self.segments.remove(&start) {
                self.buffered -= seg.len();
            }
        }
        // Trim the tail against a following segment that overlaps
        if let Some((&start, _)) = self.segments.range(offset..).next() {
            if start < offset + data.len() as u64 {
                data.truncate((start - offset) as usize);
            }
        }

        if data.is_empty() {
            return Ok(());
        }

        if self.buffered + data.len() > max_buffered {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(
                "crypto stream buffer limit exceeded",
            ));
        }
        self.buffered += data.len();
        self.segments.insert(offset, data);
        Ok(())
    }

    /// Remove and return the next contiguous chunk, if any
    pub(crate) fn read(&mut self) -> Option<Bytes> {
        let (&start, _) = self.segments.iter().next()?;
        if start != self.offset {
            return None;
        }
        let data = self.segments.remove(&start)?;
        self.buffered -= data.len();
        self.offset += data.len() as u64;
        Some(data)
    }

    /// Offset of the next byte the handshake driver will see
    pub(crate) fn bytes_read(&self) -> u64 {
        self.offset
    }
}

trait AdvanceChecked {
    fn advance_checked(&mut self, n: usize);
}

impl AdvanceChecked for Bytes {
    fn advance_checked(&mut self, n: usize) {
        let n = n.min(self.len());
        let _ = self.split_to(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 16 * 1024;

    #[test]
    fn in_order_delivery() {
        let mut assembler = Assembler::new();
        assembler.insert(0, Bytes::from_static(b"hello "), LIMIT).unwrap();
        assembler.insert(6, Bytes::from_static(b"world"), LIMIT).unwrap();
        assert_eq!(assembler.read().unwrap(), &b"hello "[..]);
        assert_eq!(assembler.read().unwrap(), &b"world"[..]);
        assert!(assembler.read().is_none());
        assert_eq!(assembler.bytes_read(), 11);
    }

    #[test]
    fn out_of_order_is_held_back() {
        let mut assembler = Assembler::new();
        assembler.insert(6, Bytes::from_static(b"world"), LIMIT).unwrap();
        assert!(assembler.read().is_none());
        assembler.insert(0, Bytes::from_static(b"hello "), LIMIT).unwrap();
        assert_eq!(assembler.read().unwrap(), &b"hello "[..]);
        assert_eq!(assembler.read().unwrap(), &b"world"[..]);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut assembler = Assembler::new();
        assembler.insert(0, Bytes::from_static(b"data"), LIMIT).unwrap();
        assembler.insert(0, Bytes::from_static(b"data"), LIMIT).unwrap();
        assert_eq!(assembler.read().unwrap(), &b"data"[..]);
        assert!(assembler.read().is_none());
        // Retransmission of delivered data is ignored too
        assembler.insert(0, Bytes::from_static(b"data"), LIMIT).unwrap();
        assert!(assembler.read().is_none());
    }

    #[test]
    fn partial_overlap_is_trimmed() {
        let mut assembler = Assembler::new();
        assembler.insert(0, Bytes::from_static(b"abcd"), LIMIT).unwrap();
        assembler.insert(2, Bytes::from_static(b"cdef"), LIMIT).unwrap();
        assert_eq!(assembler.read().unwrap(), &b"abcd"[..]);
        assert_eq!(assembler.read().unwrap(), &b"ef"[..]);
    }

    #[test]
    fn buffer_limit_is_enforced() {
        let mut assembler = Assembler::new();
        let err = assembler
            .insert(10, Bytes::from(vec![0; 32]), 16)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::CRYPTO_BUFFER_EXCEEDED);
    }
}
