//! The batching codec (C1): a ring-buffered encoder/decoder that frames small messages inline
//! and large messages by reference, used to serialize messages for reliable (TCP) transports.
//!
//! Grounded in the manual-shift `Serialize`-trait style of `frame::serial` for the header
//! encoding, and in `uflow`'s `VecDeque`-based queue style for the batch ring; the data
//! ring itself is a plain `Vec<u8>` addressed by two raw cursors, since nothing in the
//! retrieved corpus reaches for a crate (e.g. `bytes`) to do this — it's exactly the kind of
//! small, specialized byte-shuffling `frame/serial` writes by hand.

use std::collections::VecDeque;

/// The default very-small-message cutoff, in bytes: messages smaller than this are copied into
/// the inline data ring; messages at or above it are held by reference.
pub const DEFAULT_VSM_CUTOFF: usize = 256;

/// The error returned when the codec cannot accept a `put`/`bin_put` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The batch ring or data ring lacks capacity for the encoded result. Recoverable: no
    /// partial write was committed, and the caller may retry after draining with `get`/`bin_get`.
    Full,
}

#[derive(Debug)]
enum Batch {
    /// A contiguous run of bytes living in the data ring at `[offset, offset + length)`.
    Inline { offset: usize, length: usize },
    /// A reference to an externally owned message buffer. Held without copying.
    ByRef(Box<[u8]>),
}

/// A ring of batches plus a byte ring buffer, implementing the batching codec described in
/// `SPEC_FULL.md` §4.1.
pub struct Codec {
    data: Vec<u8>,
    byte_capacity: usize,
    write_pos: usize,
    read_pos: usize,
    used: usize,

    batches: VecDeque<Batch>,
    batch_capacity: usize,

    /// Bytes already consumed from the batch at the front of `batches` by a prior `get`/
    /// `bin_get`/`bin_tick` call.
    front_consumed: usize,

    vsm_cutoff: usize,
}

impl Codec {
    /// Creates a codec with room for `batch_capacity` batches and `byte_capacity` inline bytes,
    /// using the default VSM cutoff ([`DEFAULT_VSM_CUTOFF`]).
    pub fn new(batch_capacity: usize, byte_capacity: usize) -> Self {
        Self::with_cutoff(batch_capacity, byte_capacity, DEFAULT_VSM_CUTOFF)
    }

    /// Creates a codec with an explicit VSM cutoff: messages of `cutoff` bytes or more are held
    /// by reference rather than copied into the data ring.
    pub fn with_cutoff(batch_capacity: usize, byte_capacity: usize, cutoff: usize) -> Self {
        assert!(batch_capacity > 0, "codec batch capacity must be nonzero");
        assert!(byte_capacity > 0, "codec byte capacity must be nonzero");

        Self {
            data: vec![0u8; byte_capacity],
            byte_capacity,
            write_pos: 0,
            read_pos: 0,
            used: 0,

            batches: VecDeque::new(),
            batch_capacity,

            front_consumed: 0,

            vsm_cutoff: cutoff,
        }
    }

    /// The number of inline bytes currently held in the data ring. By-reference messages are
    /// not copied into the ring and do not count toward this figure.
    pub fn active(&self) -> usize {
        self.used
    }

    /// The number of inline bytes of remaining capacity in the data ring.
    pub fn space(&self) -> usize {
        self.byte_capacity - self.used
    }

    /// The number of batch-ring slots currently occupied.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    // -- header framing --------------------------------------------------

    fn encode_header(body_len: usize, more: bool) -> Vec<u8> {
        let size_plus_one = body_len + 1;

        if size_plus_one < 0xFF {
            vec![size_plus_one as u8, more as u8]
        } else {
            let mut header = Vec::with_capacity(10);
            header.push(0xFF);
            header.extend_from_slice(&(size_plus_one as u64).to_be_bytes());
            header.push(more as u8);
            header
        }
    }

    /// Returns `(header_len, body_len, more)` decoded from the first bytes at ring offset `pos`.
    fn decode_header(&self, pos: usize) -> (usize, usize, bool) {
        let first = self.data[pos];

        if first == 0 {
            panic!("corrupt codec state: frame header has zero length");
        }

        if first == 0xFF {
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&self.data[pos + 1..pos + 9]);
            let size_plus_one = u64::from_be_bytes(size_bytes) as usize;
            let more = self.data[pos + 9] != 0;
            (10, size_plus_one - 1, more)
        } else {
            let size_plus_one = first as usize;
            let more = self.data[pos + 1] != 0;
            (2, size_plus_one - 1, more)
        }
    }

    // -- ring reservation -------------------------------------------------

    fn contiguous_free_at_tail(&self) -> usize {
        if self.used == self.byte_capacity {
            return 0;
        }

        if self.write_pos >= self.read_pos {
            self.byte_capacity - self.write_pos
        } else {
            self.read_pos - self.write_pos
        }
    }

    /// Reserves `n` contiguous bytes in the data ring, returning the raw offset, or `None` if
    /// no contiguous span of that size is available (the caller must not have mutated any
    /// other state yet, so that a failed `reserve` implies no partial commit).
    fn reserve(&mut self, n: usize) -> Option<usize> {
        if n > self.byte_capacity - self.used {
            return None;
        }

        if self.contiguous_free_at_tail() >= n {
            let offset = self.write_pos;
            self.write_pos += n;
            if self.write_pos == self.byte_capacity {
                self.write_pos = 0;
            }
            self.used += n;
            return Some(offset);
        }

        // Tail doesn't fit: the invariant says a wrap starts a new batch, so try the free
        // region at the front instead. The abandoned tail bytes are never read again.
        if self.write_pos >= self.read_pos && self.read_pos >= n {
            self.write_pos = n;
            self.used += n;
            return Some(0);
        }

        None
    }

    fn mergeable_tail_offset(&self) -> Option<usize> {
        match self.batches.back() {
            Some(Batch::Inline { offset, length }) if offset + length == self.write_pos => Some(*offset),
            _ => None,
        }
    }

    // -- message-level API -------------------------------------------------

    /// Encodes one message frame and inserts it into the codec.
    ///
    /// Bodies shorter than the VSM cutoff are copied into the data ring; larger bodies are
    /// held by reference, with zero copying of the body itself. Fails (without committing any
    /// partial write) when either ring lacks the capacity for the encoded result.
    pub fn put(&mut self, msg: &[u8], more: bool) -> Result<(), CodecError> {
        let header = Self::encode_header(msg.len(), more);
        let is_byref = msg.len() >= self.vsm_cutoff;

        let can_merge_header = self.mergeable_tail_offset().is_some() && self.contiguous_free_at_tail() >= header.len();

        let new_batch_slots = usize::from(!can_merge_header) + usize::from(is_byref);
        if self.batches.len() + new_batch_slots > self.batch_capacity {
            return Err(CodecError::Full);
        }

        let payload_len = if is_byref { header.len() } else { header.len() + msg.len() };
        if payload_len > self.byte_capacity - self.used {
            return Err(CodecError::Full);
        }

        // All capacity checks passed: commit.
        if is_byref {
            let offset = self.reserve(header.len()).ok_or(CodecError::Full)?;
            self.data[offset..offset + header.len()].copy_from_slice(&header);
            self.append_inline_batch(offset, header.len());
            self.batches.push_back(Batch::ByRef(msg.to_vec().into_boxed_slice()));
        } else {
            let total = header.len() + msg.len();
            let offset = self.reserve(total).ok_or(CodecError::Full)?;
            self.data[offset..offset + header.len()].copy_from_slice(&header);
            self.data[offset + header.len()..offset + total].copy_from_slice(msg);
            self.append_inline_batch(offset, total);
        }

        Ok(())
    }

    fn append_inline_batch(&mut self, offset: usize, length: usize) {
        if let Some(Batch::Inline { offset: last_off, length: last_len }) = self.batches.back_mut() {
            if *last_off + *last_len == offset {
                *last_len += length;
                return;
            }
        }
        self.batches.push_back(Batch::Inline { offset, length });
    }

    /// Extracts one message frame, if any is fully buffered.
    ///
    /// Returns `false` (leaving `msg` untouched) when the codec holds no complete frame —
    /// either because nothing is queued, or because a header or body is still arriving (e.g.
    /// over a TCP stream fed through `bin_put` one `read()` at a time). Distinguishes inline
    /// and by-reference storage by how the body is *actually* stored, never by comparing its
    /// length against `vsm_cutoff`: `bin_put` always stores bytes inline regardless of size,
    /// so a large body moved between codecs via `bin_get`/`bin_put` is inline in the
    /// destination even though the source held it by reference.
    pub fn get(&mut self, msg: &mut Vec<u8>, more: &mut bool) -> bool {
        let Some((header_len, body_len, frame_more)) = self.peek_frame() else {
            return false;
        };

        self.consume_front_inline(header_len);

        // If consuming the header exactly emptied its batch, the body may be the very next
        // batch held whole by reference (the only way a `ByRef` batch is ever produced, by
        // `put`, is immediately following its own header).
        if self.front_consumed == 0 && body_len > 0 {
            if let Some(Batch::ByRef(_)) = self.batches.front() {
                msg.clear();
                match self.batches.pop_front() {
                    Some(Batch::ByRef(body)) => msg.extend_from_slice(&body),
                    _ => unreachable!("just matched ByRef above"),
                }
                *more = frame_more;
                return true;
            }
        }

        // Otherwise the body is plain inline bytes, possibly spanning more than one inline
        // batch if it arrived across several `bin_put` calls separated by a ring wrap.
        msg.clear();
        let mut left = body_len;
        while left > 0 {
            let (offset, length) = match self.batches.front() {
                Some(Batch::Inline { offset, length }) => (*offset, *length),
                other => panic!("corrupt codec state: expected inline body bytes, found {:?}", other),
            };
            let avail = length - self.front_consumed;
            let take = avail.min(left);
            let pos = offset + self.front_consumed;
            msg.extend_from_slice(&self.data[pos..pos + take]);
            self.consume_front_inline(take);
            left -= take;
        }

        *more = frame_more;
        true
    }

    /// Checks whether a complete frame (header plus body) is currently buffered, without
    /// mutating any state, returning `(header_len, body_len, more)` if so.
    ///
    /// The body may be satisfied by: the remainder of the header's own inline batch; a single
    /// by-reference batch immediately following a header that exactly fills its batch (the
    /// only shape `put` ever produces); or a run of subsequent inline batches (the shape
    /// `bin_put` produces when a frame arrives across more than one write, e.g. split TCP
    /// reads separated by a ring wrap).
    fn peek_frame(&self) -> Option<(usize, usize, bool)> {
        let (offset, length) = match self.batches.front() {
            Some(Batch::Inline { offset, length }) => (*offset, *length),
            Some(Batch::ByRef(_)) => panic!("corrupt codec state: by-reference batch with no preceding header"),
            None => return None,
        };

        let header_pos = offset + self.front_consumed;
        let avail0 = length - self.front_consumed;

        // Need at least the short header's two bytes to even know how long the header is.
        if avail0 < 2 {
            return None;
        }

        let first = self.data[header_pos];
        if first == 0 {
            panic!("corrupt codec state: frame header has zero length");
        }
        let header_len = if first == 0xFF { 10 } else { 2 };
        if avail0 < header_len {
            return None;
        }

        let (_, body_len, frame_more) = self.decode_header(header_pos);

        let inline_after_header = avail0 - header_len;
        if inline_after_header >= body_len {
            return Some((header_len, body_len, frame_more));
        }

        if inline_after_header == 0 && body_len > 0 {
            if let Some(Batch::ByRef(body)) = self.batches.iter().nth(1) {
                return if body.len() == body_len { Some((header_len, body_len, frame_more)) } else { None };
            }
        }

        // Remaining body bytes (if any) must come from a run of subsequent inline batches.
        let mut remaining = body_len - inline_after_header;
        for batch in self.batches.iter().skip(1) {
            if remaining == 0 {
                break;
            }
            match batch {
                Batch::Inline { length, .. } => remaining = remaining.saturating_sub(*length),
                Batch::ByRef(_) => return None,
            }
        }

        if remaining == 0 {
            Some((header_len, body_len, frame_more))
        } else {
            None
        }
    }

    /// Consumes `n` bytes from the inline batch currently at the front of the batch ring,
    /// popping it (and releasing its ring space) if it becomes empty.
    fn consume_front_inline(&mut self, n: usize) {
        self.front_consumed += n;
        self.used -= n;

        if let Some(Batch::Inline { length, .. }) = self.batches.front() {
            if self.front_consumed == *length {
                self.batches.pop_front();
                self.front_consumed = 0;
                self.sync_read_pos();
            }
        }
    }

    /// After fully consuming an inline batch, moves `read_pos` to the next inline batch's
    /// offset (skipping over any by-reference batches, which hold no ring bytes, and any dead
    /// bytes abandoned by a prior wrap).
    fn sync_read_pos(&mut self) {
        for batch in self.batches.iter() {
            if let Batch::Inline { offset, .. } = batch {
                self.read_pos = *offset;
                return;
            }
        }
        self.read_pos = self.write_pos;
    }

    // -- zero-copy stream view ---------------------------------------------

    /// Returns a contiguous slice of the bytes remaining in the batch currently at the front of
    /// the ring, for a writer that streams bytes out directly (e.g. onto a TCP socket).
    ///
    /// Returns an empty slice when the codec holds no data.
    pub fn bin_get(&self) -> &[u8] {
        match self.batches.front() {
            Some(Batch::Inline { offset, length }) => &self.data[offset + self.front_consumed..offset + length],
            Some(Batch::ByRef(body)) => &body[self.front_consumed..],
            None => &[],
        }
    }

    /// Reports that `n` bytes returned by the most recent [`bin_get`](Self::bin_get) call were
    /// consumed by the caller. When this empties the front batch, its slot is released; for a
    /// by-reference batch, the backing message is dropped.
    pub fn bin_tick(&mut self, n: usize) {
        if n == 0 {
            return;
        }

        match self.batches.front() {
            Some(Batch::Inline { .. }) => self.consume_front_inline(n),
            Some(Batch::ByRef(body)) => {
                self.front_consumed += n;
                if self.front_consumed >= body.len() {
                    self.batches.pop_front();
                    self.front_consumed = 0;
                }
            }
            None => {}
        }
    }

    /// Inserts opaque bytes directly into the data ring, with no frame-header awareness. Used
    /// to pipe one codec's `bin_get`/`bin_tick` output into another codec's input, preserving
    /// frame boundaries implicitly (the bytes already contain valid headers).
    pub fn bin_put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let can_merge = self.mergeable_tail_offset().is_some() && self.contiguous_free_at_tail() >= bytes.len();
        let new_slots = usize::from(!can_merge);

        if self.batches.len() + new_slots > self.batch_capacity {
            return Err(CodecError::Full);
        }
        if bytes.len() > self.byte_capacity - self.used {
            return Err(CodecError::Full);
        }

        let offset = self.reserve(bytes.len()).ok_or(CodecError::Full)?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.append_inline_batch(offset, bytes.len());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_small_messages_preserve_order_and_more_flag() {
        let mut codec = Codec::new(16, 4096);

        let msgs: Vec<(Vec<u8>, bool)> = vec![
            (b"a".to_vec(), false),
            (b"bcdef".to_vec(), true),
            (vec![], false),
            (b"last one".to_vec(), true),
        ];

        for (body, more) in &msgs {
            codec.put(body, *more).unwrap();
        }

        for (body, more) in &msgs {
            let mut out = Vec::new();
            let mut out_more = false;
            assert!(codec.get(&mut out, &mut out_more));
            assert_eq!(&out, body);
            assert_eq!(out_more, *more);
        }

        assert_eq!(codec.active(), 0);
    }

    #[test]
    fn round_trip_by_reference_messages() {
        let mut codec = Codec::with_cutoff(16, 4096, 8);

        let big = vec![0x42u8; 64];
        codec.put(&big, true).unwrap();

        let mut out = Vec::new();
        let mut more = false;
        assert!(codec.get(&mut out, &mut more));
        assert_eq!(out, big);
        assert!(more);
    }

    #[test]
    fn mixed_small_and_large_messages_round_trip_in_order() {
        let mut codec = Codec::with_cutoff(16, 4096, 8);

        let frames: Vec<(Vec<u8>, bool)> = vec![
            (b"tiny".to_vec(), false),
            (vec![7u8; 100], true),
            (b"ok".to_vec(), false),
        ];

        for (body, more) in &frames {
            codec.put(body, *more).unwrap();
        }

        for (body, more) in &frames {
            let mut out = Vec::new();
            let mut out_more = false;
            assert!(codec.get(&mut out, &mut out_more));
            assert_eq!(&out, body);
            assert_eq!(out_more, *more);
        }
    }

    #[test]
    fn get_returns_false_when_empty() {
        let mut codec = Codec::new(4, 64);
        let mut out = Vec::new();
        let mut more = false;
        assert!(!codec.get(&mut out, &mut more));
    }

    #[test]
    fn put_never_commits_a_partial_frame_on_batch_exhaustion() {
        let mut codec = Codec::new(2, 4096);

        codec.put(b"one", false).unwrap();
        codec.put(b"two", false).unwrap();

        let active_before = codec.active();
        // Forces a new by-reference batch slot (cutoff default 256), which the 2-slot batch
        // ring (already holding 2 merged-or-separate inline batches) cannot accommodate once
        // the two prior puts failed to merge (different vsm path) -- use an oversized message
        // to guarantee a by-reference batch is required.
        let big = vec![0u8; DEFAULT_VSM_CUTOFF + 1];
        let result = codec.put(&big, false);

        if result.is_err() {
            assert_eq!(codec.active(), active_before);
        }
    }

    #[test]
    fn put_fails_cleanly_on_byte_exhaustion() {
        let mut codec = Codec::new(64, 16);

        // Fill to near capacity.
        while codec.put(b"xxxxxxxxxxxxxx", false).is_ok() {}

        let active_before = codec.active();
        assert_eq!(codec.put(b"xxxxxxxxxxxxxx", false), Err(CodecError::Full));
        assert_eq!(codec.active(), active_before);
    }

    #[test]
    fn bin_get_bin_tick_bin_put_round_trip_between_two_codecs() {
        let mut src = Codec::with_cutoff(32, 4096, 32);
        let mut dst = Codec::with_cutoff(32, 4096, 32);

        let frames: Vec<(Vec<u8>, bool)> = vec![
            (b"hello".to_vec(), true),
            (b"world".to_vec(), false),
            (vec![9u8; 200], true),
        ];

        for (body, more) in &frames {
            src.put(body, *more).unwrap();
        }

        loop {
            let chunk = src.bin_get();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len();
            let chunk = chunk.to_vec();
            dst.bin_put(&chunk).unwrap();
            src.bin_tick(n);
        }

        for (body, more) in &frames {
            let mut out = Vec::new();
            let mut out_more = false;
            assert!(dst.get(&mut out, &mut out_more));
            assert_eq!(&out, body);
            assert_eq!(out_more, *more);
        }
    }

    #[test]
    fn many_small_messages_merge_into_few_batch_slots() {
        let mut codec = Codec::new(4, 65536);

        for i in 0..200u32 {
            codec.put(&i.to_be_bytes(), false).unwrap();
        }

        assert!(codec.batch_count() <= 4, "expected merging to keep batch count low, got {}", codec.batch_count());

        for i in 0..200u32 {
            let mut out = Vec::new();
            let mut more = false;
            assert!(codec.get(&mut out, &mut more));
            assert_eq!(out, i.to_be_bytes().to_vec());
        }
    }

    #[test]
    fn extended_header_round_trips_for_large_bodies() {
        let mut codec = Codec::with_cutoff(4, 1 << 20, 1 << 18);
        let body = vec![5u8; 300];

        codec.put(&body, false).unwrap();

        let mut out = Vec::new();
        let mut more = true;
        assert!(codec.get(&mut out, &mut more));
        assert_eq!(out, body);
        assert!(!more);
    }

    #[test]
    fn bin_put_reconstructed_large_body_decodes_inline_even_though_source_held_it_by_reference() {
        // `src`'s cutoff makes this body by-reference; `dst`'s wider cutoff would, under the
        // old length-based `get`, have been read as inline regardless -- the point here is
        // that `get` must not consult `vsm_cutoff` at all once bytes cross `bin_put`.
        let mut src = Codec::with_cutoff(8, 4096, 32);
        let mut dst = Codec::with_cutoff(8, 4096, 4096);

        let body = vec![0xABu8; 200];
        src.put(&body, false).unwrap();

        loop {
            let chunk = src.bin_get();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len();
            dst.bin_put(&chunk.to_vec()).unwrap();
            src.bin_tick(n);
        }

        let mut out = Vec::new();
        let mut more = true;
        assert!(dst.get(&mut out, &mut more));
        assert_eq!(out, body);
        assert!(!more);
    }

    #[test]
    fn get_reports_no_frame_until_a_split_header_fully_arrives() {
        let mut encoder = Codec::new(4, 4096);
        encoder.put(b"ICANHAZ?", false).unwrap();

        let wire: Vec<u8> = {
            let mut v = Vec::new();
            loop {
                let chunk = encoder.bin_get();
                if chunk.is_empty() {
                    break;
                }
                v.extend_from_slice(chunk);
                let n = chunk.len();
                encoder.bin_tick(n);
            }
            v
        };

        let mut decoder = Codec::new(4, 4096);

        // Feed only the header's first byte: not even a full short header is present yet.
        decoder.bin_put(&wire[0..1]).unwrap();
        let mut out = Vec::new();
        let mut more = true;
        assert!(!decoder.get(&mut out, &mut more), "must not decode from a partial header");

        // Feed the rest of the header but none of the body.
        decoder.bin_put(&wire[1..2]).unwrap();
        assert!(!decoder.get(&mut out, &mut more), "must not decode from a header with no body yet");

        // Feed everything but the last body byte.
        decoder.bin_put(&wire[2..wire.len() - 1]).unwrap();
        assert!(!decoder.get(&mut out, &mut more), "must not decode one byte short of the full body");

        // Feed the last byte; the frame is now complete.
        decoder.bin_put(&wire[wire.len() - 1..]).unwrap();
        assert!(decoder.get(&mut out, &mut more));
        assert_eq!(out, b"ICANHAZ?");
        assert!(!more);
    }

    #[test]
    fn get_does_not_underflow_when_body_split_across_two_bin_put_calls() {
        let mut encoder = Codec::new(4, 4096);
        let body = vec![0x11u8; 500];
        encoder.put(&body, true).unwrap();

        let wire: Vec<u8> = {
            let mut v = Vec::new();
            loop {
                let chunk = encoder.bin_get();
                if chunk.is_empty() {
                    break;
                }
                v.extend_from_slice(chunk);
                let n = chunk.len();
                encoder.bin_tick(n);
            }
            v
        };

        let mut decoder = Codec::new(4, 4096);
        let split = wire.len() / 2;
        decoder.bin_put(&wire[..split]).unwrap();

        let mut out = Vec::new();
        let mut more = false;
        assert!(!decoder.get(&mut out, &mut more), "body not fully buffered yet");

        decoder.bin_put(&wire[split..]).unwrap();
        assert!(decoder.get(&mut out, &mut more));
        assert_eq!(out, body);
        assert!(more);
    }
}
