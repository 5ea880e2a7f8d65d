//! Minimal single-segment Cap'n Proto encoder/decoder.
//!
//! This is not a general-purpose Cap'n Proto implementation. It supports
//! exactly what the tunnel protocol needs: one segment, struct and list
//! pointers, text, data, and composite lists. Multi-segment messages, far
//! pointers and capability pointers are rejected.
//!
//! Wire format reference: <https://capnproto.org/encoding.html>.
//! All multi-byte integers are little-endian.

use thiserror::Error;

/// Size of one Cap'n Proto word in bytes.
pub const WORD: usize = 8;

/// Default scratch capacity for encoded messages.
pub const ENCODE_SCRATCH: usize = 4096;

/// List element-size tag for byte lists (text and data).
pub const ELEM_BYTE: u8 = 2;

/// List element-size tag for composite (struct) lists.
pub const ELEM_COMPOSITE: u8 = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("message too short: {0} bytes")]
    MessageTooShort(usize),

    #[error("multi-segment messages not supported (got {0} segments)")]
    MultiSegment(u32),

    #[error("segment overflows message: {need} bytes needed, {have} available")]
    SegmentOverflow { need: usize, have: usize },

    #[error("pointer out of bounds at offset {0}")]
    PointerOutOfBounds(usize),

    #[error("expected {expected} pointer at offset {offset}, got type {found}")]
    WrongPointerType {
        expected: &'static str,
        found: u8,
        offset: usize,
    },

    #[error("expected byte list (element size 2), got element size {0}")]
    NotByteList(u8),

    #[error("expected composite list (element size 7), got element size {0}")]
    NotComposite(u8),

    #[error("list data out of bounds at offset {0}")]
    DataOutOfBounds(usize),

    #[error("encode buffer overflow: {need} bytes needed, capacity {cap}")]
    BufferOverflow { need: usize, cap: usize },
}

fn read_le16(p: &[u8]) -> u16 {
    u16::from_le_bytes([p[0], p[1]])
}

fn read_le32(p: &[u8]) -> u32 {
    u32::from_le_bytes([p[0], p[1], p[2], p[3]])
}

fn read_le64(p: &[u8]) -> u64 {
    u64::from_le_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]])
}

fn write_le32(p: &mut [u8], v: u32) {
    p[..4].copy_from_slice(&v.to_le_bytes());
}

/// Builder for a single-segment message over a bounded scratch buffer.
///
/// Allocation order determines layout; callers allocate the root pointer
/// word first, then structs and list bodies, writing pointers as they go.
/// Exceeding the capacity is a recoverable [`CodecError::BufferOverflow`],
/// never a panic.
pub struct Builder {
    buf: Vec<u8>,
    cap: usize,
}

impl Builder {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Allocates `words` zeroed words, returning their byte offset.
    pub fn alloc(&mut self, words: usize) -> Result<usize, CodecError> {
        let offset = self.buf.len();
        let need = offset + words * WORD;
        if need > self.cap {
            return Err(CodecError::BufferOverflow {
                need,
                cap: self.cap,
            });
        }
        self.buf.resize(need, 0);
        Ok(offset)
    }

    /// Writes one byte into a previously allocated region.
    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.buf[offset] = value;
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_bit(&mut self, offset: usize, bit: u8) {
        self.buf[offset] |= 1 << bit;
    }

    /// Writes a struct pointer at `ptr_off` pointing at `struct_off`.
    ///
    /// Layout: bits `[0..2]` type tag `0`, bits `[2..32]` signed word offset
    /// from the word following the pointer, bits `[32..48]` data words,
    /// bits `[48..64]` pointer words.
    pub fn write_struct_ptr(
        &mut self,
        ptr_off: usize,
        struct_off: usize,
        data_words: u16,
        ptr_count: u16,
    ) {
        let off_words = ((struct_off as i64 - ptr_off as i64 - WORD as i64) / WORD as i64) as i32;
        let lo = (off_words << 2) as u32;
        let hi = data_words as u32 | ((ptr_count as u32) << 16);
        write_le32(&mut self.buf[ptr_off..], lo);
        write_le32(&mut self.buf[ptr_off + 4..], hi);
    }

    /// Writes a list pointer at `ptr_off` pointing at `list_off`.
    ///
    /// `count` is the element count, except for composite lists where it is
    /// the total word count of the body including the tag word.
    pub fn write_list_ptr(&mut self, ptr_off: usize, list_off: usize, elem_size: u8, count: u32) {
        let off_words = ((list_off as i64 - ptr_off as i64 - WORD as i64) / WORD as i64) as i32;
        let lo = ((off_words << 2) as u32) | 0x01;
        let hi = elem_size as u32 | (count << 3);
        write_le32(&mut self.buf[ptr_off..], lo);
        write_le32(&mut self.buf[ptr_off + 4..], hi);
    }

    /// Writes the tag word of a composite list at `tag_off`. The tag has
    /// struct-pointer shape with the offset field holding the element count.
    pub fn write_composite_tag(
        &mut self,
        tag_off: usize,
        elem_count: u32,
        data_words: u16,
        ptr_count: u16,
    ) {
        let lo = elem_count << 2;
        let hi = data_words as u32 | ((ptr_count as u32) << 16);
        write_le32(&mut self.buf[tag_off..], lo);
        write_le32(&mut self.buf[tag_off + 4..], hi);
    }

    /// Writes text: a byte list whose count includes a trailing NUL.
    /// Empty text encodes as a null pointer.
    pub fn write_text(&mut self, ptr_off: usize, text: &str) -> Result<(), CodecError> {
        if text.is_empty() {
            return Ok(());
        }
        let byte_count = text.len() + 1;
        let words = byte_count.div_ceil(WORD);
        let data_off = self.alloc(words)?;
        self.buf[data_off..data_off + text.len()].copy_from_slice(text.as_bytes());
        self.write_list_ptr(ptr_off, data_off, ELEM_BYTE, byte_count as u32);
        Ok(())
    }

    /// Writes raw data: a byte list without a NUL terminator.
    /// Empty data encodes as a null pointer.
    pub fn write_data(&mut self, ptr_off: usize, data: &[u8]) -> Result<(), CodecError> {
        if data.is_empty() {
            return Ok(());
        }
        let words = data.len().div_ceil(WORD);
        let data_off = self.alloc(words)?;
        self.buf[data_off..data_off + data.len()].copy_from_slice(data);
        self.write_list_ptr(ptr_off, data_off, ELEM_BYTE, data.len() as u32);
        Ok(())
    }

    /// Emits the wire message: segment table (`count - 1 = 0`, segment size
    /// in words) followed by the segment body.
    pub fn finalize(self) -> Vec<u8> {
        debug_assert_eq!(self.buf.len() % WORD, 0);
        let seg_words = (self.buf.len() / WORD) as u32;
        let mut out = Vec::with_capacity(WORD + self.buf.len());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&seg_words.to_le_bytes());
        out.extend_from_slice(&self.buf);
        out
    }
}

/// Location and shape of a struct inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructRef {
    /// Absolute byte offset of the data section.
    pub data_off: usize,
    pub data_words: u16,
    pub ptr_count: u16,
}

impl StructRef {
    /// Byte offset of the pointer section.
    pub fn ptr_section(&self) -> usize {
        self.data_off + self.data_words as usize * WORD
    }

    /// Byte offset of the i-th pointer slot.
    pub fn ptr_off(&self, i: usize) -> usize {
        self.ptr_section() + i * WORD
    }
}

/// Location and shape of a list inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListRef {
    /// Absolute byte offset of the list body (the tag word for composites).
    pub data_off: usize,
    pub elem_size: u8,
    /// Element count, or total body words including the tag for composites.
    pub count: u32,
}

/// Shape of a composite list read from its tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeShape {
    pub elem_count: u32,
    pub data_words: u16,
    pub ptr_count: u16,
}

impl CompositeShape {
    /// Byte stride of one element.
    pub fn stride(&self) -> usize {
        (self.data_words as usize + self.ptr_count as usize) * WORD
    }
}

/// Reader over a single-segment message.
pub struct Reader<'a> {
    seg: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Parses the segment table and bounds-checks the first segment.
    pub fn new(data: &'a [u8]) -> Result<Self, CodecError> {
        if data.len() < WORD {
            return Err(CodecError::MessageTooShort(data.len()));
        }
        let num_segs_minus1 = read_le32(data);
        if num_segs_minus1 != 0 {
            return Err(CodecError::MultiSegment(num_segs_minus1 + 1));
        }
        let seg_bytes = read_le32(&data[4..]) as usize * WORD;
        if WORD + seg_bytes > data.len() {
            return Err(CodecError::SegmentOverflow {
                need: WORD + seg_bytes,
                have: data.len(),
            });
        }
        Ok(Self {
            seg: &data[WORD..WORD + seg_bytes],
        })
    }

    pub fn segment_len(&self) -> usize {
        self.seg.len()
    }

    fn pointer_words(&self, ptr_off: usize) -> Result<(u32, u32), CodecError> {
        if ptr_off + WORD > self.seg.len() {
            return Err(CodecError::PointerOutOfBounds(ptr_off));
        }
        Ok((read_le32(&self.seg[ptr_off..]), read_le32(&self.seg[ptr_off + 4..])))
    }

    /// Reads a struct pointer. A null (all-zero) pointer yields `Ok(None)`.
    pub fn read_struct_ptr(&self, ptr_off: usize) -> Result<Option<StructRef>, CodecError> {
        let (lo, hi) = self.pointer_words(ptr_off)?;
        if lo == 0 && hi == 0 {
            return Ok(None);
        }
        if lo & 3 != 0 {
            return Err(CodecError::WrongPointerType {
                expected: "struct",
                found: (lo & 3) as u8,
                offset: ptr_off,
            });
        }
        let off_words = (lo as i32) >> 2;
        let data_words = (hi & 0xFFFF) as u16;
        let ptr_count = (hi >> 16) as u16;
        let data_off = Self::target_offset(ptr_off, off_words);
        let end = data_off + (data_words as usize + ptr_count as usize) * WORD;
        if end > self.seg.len() {
            return Err(CodecError::PointerOutOfBounds(ptr_off));
        }
        Ok(Some(StructRef {
            data_off,
            data_words,
            ptr_count,
        }))
    }

    /// Reads a list pointer. A null pointer yields `Ok(None)`.
    pub fn read_list_ptr(&self, ptr_off: usize) -> Result<Option<ListRef>, CodecError> {
        let (lo, hi) = self.pointer_words(ptr_off)?;
        if lo == 0 && hi == 0 {
            return Ok(None);
        }
        if lo & 3 != 1 {
            return Err(CodecError::WrongPointerType {
                expected: "list",
                found: (lo & 3) as u8,
                offset: ptr_off,
            });
        }
        let off_words = (lo as i32) >> 2;
        Ok(Some(ListRef {
            data_off: Self::target_offset(ptr_off, off_words),
            elem_size: (hi & 7) as u8,
            count: hi >> 3,
        }))
    }

    /// Reads the tag word of a composite list and returns its element shape.
    pub fn read_composite_shape(&self, list: &ListRef) -> Result<CompositeShape, CodecError> {
        if list.elem_size != ELEM_COMPOSITE {
            return Err(CodecError::NotComposite(list.elem_size));
        }
        if list.data_off + WORD > self.seg.len() {
            return Err(CodecError::DataOutOfBounds(list.data_off));
        }
        let lo = read_le32(&self.seg[list.data_off..]);
        let hi = read_le32(&self.seg[list.data_off + 4..]);
        let shape = CompositeShape {
            elem_count: ((lo as i32) >> 2) as u32,
            data_words: (hi & 0xFFFF) as u16,
            ptr_count: (hi >> 16) as u16,
        };
        let body_end = list.data_off + WORD + shape.elem_count as usize * shape.stride();
        if body_end > self.seg.len() {
            return Err(CodecError::DataOutOfBounds(list.data_off));
        }
        Ok(shape)
    }

    /// Reads text, returning the bytes without the trailing NUL.
    /// A null pointer decodes as empty.
    pub fn read_text(&self, ptr_off: usize) -> Result<&'a [u8], CodecError> {
        match self.read_byte_list(ptr_off)? {
            Some(bytes) if !bytes.is_empty() => Ok(&bytes[..bytes.len() - 1]),
            _ => Ok(&[]),
        }
    }

    /// Reads raw data. A null pointer decodes as empty.
    pub fn read_data(&self, ptr_off: usize) -> Result<&'a [u8], CodecError> {
        Ok(self.read_byte_list(ptr_off)?.unwrap_or(&[]))
    }

    fn read_byte_list(&self, ptr_off: usize) -> Result<Option<&'a [u8]>, CodecError> {
        let Some(list) = self.read_list_ptr(ptr_off)? else {
            return Ok(None);
        };
        if list.elem_size != ELEM_BYTE {
            return Err(CodecError::NotByteList(list.elem_size));
        }
        let end = list.data_off + list.count as usize;
        if end > self.seg.len() {
            return Err(CodecError::DataOutOfBounds(list.data_off));
        }
        Ok(Some(&self.seg[list.data_off..end]))
    }

    /// Fixed-width reads from a struct's data section. Out-of-range offsets
    /// read as zero, matching absent fields in older schema revisions.
    pub fn read_u8(&self, data_off: usize, byte_off: usize) -> u8 {
        let off = data_off + byte_off;
        if off + 1 > self.seg.len() {
            return 0;
        }
        self.seg[off]
    }

    pub fn read_u16(&self, data_off: usize, byte_off: usize) -> u16 {
        let off = data_off + byte_off;
        if off + 2 > self.seg.len() {
            return 0;
        }
        read_le16(&self.seg[off..])
    }

    pub fn read_u32(&self, data_off: usize, byte_off: usize) -> u32 {
        let off = data_off + byte_off;
        if off + 4 > self.seg.len() {
            return 0;
        }
        read_le32(&self.seg[off..])
    }

    pub fn read_u64(&self, data_off: usize, byte_off: usize) -> u64 {
        let off = data_off + byte_off;
        if off + 8 > self.seg.len() {
            return 0;
        }
        read_le64(&self.seg[off..])
    }

    pub fn read_bool(&self, data_off: usize, byte_off: usize, bit: u8) -> bool {
        (self.read_u8(data_off, byte_off) >> bit) & 1 == 1
    }

    fn target_offset(ptr_off: usize, off_words: i32) -> usize {
        (ptr_off as i64 + WORD as i64 + off_words as i64 * WORD as i64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_ptr_roundtrip() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        let s = b.alloc(3).unwrap(); // 2 data words + 1 pointer
        b.write_struct_ptr(rp, s, 2, 1);
        b.set_u16(s, 0x1234);
        b.set_u64(s + 8, 0xDEAD_BEEF_CAFE_F00D);
        let wire = b.finalize();

        let r = Reader::new(&wire).unwrap();
        let sr = r.read_struct_ptr(0).unwrap().expect("non-null");
        assert_eq!(sr.data_off, 8);
        assert_eq!(sr.data_words, 2);
        assert_eq!(sr.ptr_count, 1);
        assert_eq!(r.read_u16(sr.data_off, 0), 0x1234);
        assert_eq!(r.read_u64(sr.data_off, 8), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(sr.ptr_section(), 8 + 16);
    }

    #[test]
    fn test_null_struct_ptr() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        b.alloc(1).unwrap();
        let wire = b.finalize();
        let r = Reader::new(&wire).unwrap();
        assert_eq!(r.read_struct_ptr(0).unwrap(), None);
    }

    #[test]
    fn test_text_roundtrip() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        b.write_text(rp, "hello world").unwrap();
        let wire = b.finalize();

        let r = Reader::new(&wire).unwrap();
        assert_eq!(r.read_text(0).unwrap(), b"hello world");

        // The list count includes the NUL terminator.
        let list = r.read_list_ptr(0).unwrap().unwrap();
        assert_eq!(list.elem_size, ELEM_BYTE);
        assert_eq!(list.count, 12);
    }

    #[test]
    fn test_empty_text_is_null_pointer() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        b.write_text(rp, "").unwrap();
        let wire = b.finalize();

        let r = Reader::new(&wire).unwrap();
        assert_eq!(r.read_list_ptr(0).unwrap(), None);
        assert_eq!(r.read_text(0).unwrap(), b"");
    }

    #[test]
    fn test_data_roundtrip_no_nul() {
        let payload: Vec<u8> = (0..16).collect();
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        b.write_data(rp, &payload).unwrap();
        let wire = b.finalize();

        let r = Reader::new(&wire).unwrap();
        assert_eq!(r.read_data(0).unwrap(), &payload[..]);
        assert_eq!(r.read_list_ptr(0).unwrap().unwrap().count, 16);
    }

    #[test]
    fn test_composite_list_layout() {
        // Three elements of shape (0 data, 2 pointers).
        let (dw, pc, n) = (0u16, 2u16, 3usize);
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        let body_words = 1 + n * (dw + pc) as usize;
        let list = b.alloc(body_words).unwrap();
        b.write_composite_tag(list, n as u32, dw, pc);
        b.write_list_ptr(rp, list, ELEM_COMPOSITE, body_words as u32);
        for i in 0..n {
            let elem = list + WORD + i * (dw + pc) as usize * WORD;
            b.write_text(elem, &format!("k{i}")).unwrap();
            b.write_text(elem + WORD, &format!("v{i}")).unwrap();
        }
        let wire = b.finalize();

        let r = Reader::new(&wire).unwrap();
        let list = r.read_list_ptr(0).unwrap().unwrap();
        // Count field holds the total body words including the tag.
        assert_eq!(list.count as usize, 1 + n * (dw + pc) as usize);
        let shape = r.read_composite_shape(&list).unwrap();
        assert_eq!(shape.elem_count as usize, n);
        assert_eq!(shape.data_words, dw);
        assert_eq!(shape.ptr_count, pc);
        for i in 0..n {
            let elem = list.data_off + WORD + i * shape.stride();
            assert_eq!(r.read_text(elem).unwrap(), format!("k{i}").as_bytes());
            assert_eq!(r.read_text(elem + WORD).unwrap(), format!("v{i}").as_bytes());
        }
    }

    #[test]
    fn test_empty_composite_list() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        let list = b.alloc(1).unwrap();
        b.write_composite_tag(list, 0, 0, 2);
        b.write_list_ptr(rp, list, ELEM_COMPOSITE, 1);
        let wire = b.finalize();

        let r = Reader::new(&wire).unwrap();
        let list = r.read_list_ptr(0).unwrap().unwrap();
        assert_eq!(list.count, 1);
        let shape = r.read_composite_shape(&list).unwrap();
        assert_eq!(shape.elem_count, 0);
    }

    #[test]
    fn test_multi_segment_rejected() {
        let mut wire = vec![0u8; 16];
        wire[0] = 1; // segment count - 1 = 1
        assert!(matches!(
            Reader::new(&wire),
            Err(CodecError::MultiSegment(2))
        ));
    }

    #[test]
    fn test_segment_overflow_rejected() {
        let mut wire = vec![0u8; 16];
        wire[4] = 4; // claims 4 words but only 1 present
        assert!(matches!(
            Reader::new(&wire),
            Err(CodecError::SegmentOverflow { .. })
        ));
    }

    #[test]
    fn test_wrong_pointer_type() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        b.write_text(rp, "x").unwrap();
        let wire = b.finalize();
        let r = Reader::new(&wire).unwrap();
        assert!(matches!(
            r.read_struct_ptr(0),
            Err(CodecError::WrongPointerType {
                expected: "struct",
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_pointer_past_segment_end() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        // Claim a struct far past the end of the one-word segment.
        b.write_struct_ptr(rp, rp + 8, 8, 8);
        let wire = b.finalize();
        let r = Reader::new(&wire).unwrap();
        assert!(matches!(
            r.read_struct_ptr(0),
            Err(CodecError::PointerOutOfBounds(_))
        ));
    }

    #[test]
    fn test_alloc_overflow_is_an_error() {
        let mut b = Builder::new(16);
        b.alloc(2).unwrap();
        assert_eq!(
            b.alloc(1),
            Err(CodecError::BufferOverflow { need: 24, cap: 16 })
        );
        // Text allocation reports the same error instead of panicking.
        let mut b = Builder::new(8);
        let rp = b.alloc(1).unwrap();
        assert!(matches!(
            b.write_text(rp, "this will not fit"),
            Err(CodecError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_out_of_range_scalar_reads_are_zero() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        b.alloc(1).unwrap();
        let wire = b.finalize();
        let r = Reader::new(&wire).unwrap();
        assert_eq!(r.read_u16(0, 100), 0);
        assert_eq!(r.read_u64(4, 8), 0);
        assert!(!r.read_bool(0, 100, 0));
    }

    #[test]
    fn test_little_endian_layout() {
        let mut b = Builder::new(ENCODE_SCRATCH);
        let rp = b.alloc(1).unwrap();
        let s = b.alloc(1).unwrap();
        b.write_struct_ptr(rp, s, 1, 0);
        b.set_u16(s, 0xABCD);
        let wire = b.finalize();
        // Segment table: count-1 then size in words, both LE.
        assert_eq!(&wire[..4], &[0, 0, 0, 0]);
        assert_eq!(&wire[4..8], &[2, 0, 0, 0]);
        // Struct data word: 0xABCD little-endian.
        assert_eq!(wire[16], 0xCD);
        assert_eq!(wire[17], 0xAB);
    }
}
