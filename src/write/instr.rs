//! The packed write-instruction format and its encoder.
//!
//! A stream is a chain of 8-byte aligned blocks of 32-bit little-endian
//! words. Each instruction starts with a flags word whose low nibble is
//! the opcode; bits 1, 2 and 3 of the opcode double as value, key and
//! conditional presence markers. A keyed instruction continues with:
//!
//! ```text
//! +0   flags
//! +1   dbi
//! +2   key length
//! +3   key bytes, padded so the value field starts 8-byte aligned
//!      (at least 16 bytes of slack follow the key)
//!      value length        (32-bit word right before the value pointer)
//!      value pointer       (8 bytes)
//!      [status slot]       (8 bytes, compressible values only: holds the
//!                           compressor address, then the compression
//!                           status)
//!      [conditional version] (8-byte float)
//!      [set version]         (8-byte float)
//! ```
//!
//! Keyless instructions are two words, plus an 8-byte payload for
//! `POINTER_NEXT`. The flags word is the only synchronisation channel
//! between encoder and executor: fields are published by an atomic swap of
//! the flags word and the executor ORs status bits back into it.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

// opcodes (low nibble of the flags word)
pub(crate) const NO_INSTRUCTION_YET: u32 = 0;
pub(crate) const START_BLOCK: u32 = 1;
pub(crate) const BLOCK_END: u32 = 2;
pub(crate) const POINTER_NEXT: u32 = 3;
pub(crate) const START_CONDITION_BLOCK: u32 = 4;
pub(crate) const USER_CALLBACK: u32 = 8;
pub(crate) const DROP_DB: u32 = 12;
pub(crate) const DEL: u32 = 13;
pub(crate) const DEL_VALUE: u32 = 14;
pub(crate) const PUT: u32 = 15;

// presence bits inside the opcode nibble
pub(crate) const HAS_KEY: u32 = 4;
pub(crate) const HAS_VALUE: u32 = 2;
pub(crate) const CONDITIONAL: u32 = 8;

/// Refuse the write when the key already exists; on a condition block,
/// require the key to be absent.
pub const NO_OVERWRITE: u32 = 0x10;
/// Refuse the write when the exact key/value pair already exists.
pub const NO_DUP_DATA: u32 = 0x20;
pub(crate) const IF_NO_EXISTS: u32 = NO_OVERWRITE;
pub(crate) const CONDITIONAL_VERSION: u32 = 0x100;
pub(crate) const SET_VERSION: u32 = 0x200;
pub(crate) const DELETE_DATABASE: u32 = 0x400;
/// The key sorts after every existing key; skip the comparison walk.
pub const APPEND: u32 = 0x20000;
/// Like `APPEND` for duplicate values.
pub const APPEND_DUP: u32 = 0x40000;
pub(crate) const COMPRESSIBLE: u32 = 0x10_0000;
pub(crate) const USER_CALLBACK_STRICT_ORDER: u32 = 0x10_0000;

// status bits the executor ORs into the flags word
pub const FINISHED_OPERATION: u32 = 0x0100_0000;
pub const WAITING_OPERATION: u32 = 0x0200_0000;
pub const FAILED_CONDITION: u32 = 0x0400_0000;
pub const TXN_DELIMITER: u32 = 0x0800_0000;
pub const TXN_COMMITTED: u32 = 0x1000_0000;
pub const TXN_FLUSHED: u32 = 0x2000_0000;
pub const TXN_HAD_ERROR: u32 = 0x4000_0000;

pub(crate) const OPCODE_MASK: u32 = 0xf;
pub(crate) const PUT_FLAG_MASK: u32 =
    NO_OVERWRITE | NO_DUP_DATA | APPEND | APPEND_DUP;
pub(crate) const UNKNOWN_FLAG_BITS: u32 = 0xf0c0;
const ENDED_BITS: u32 = TXN_DELIMITER | TXN_COMMITTED | TXN_HAD_ERROR;

/// Words per block: 32 KiB each.
const BLOCK_WORDS: usize = 0x2000;

struct Block {
    // u64 cells keep the block 8-byte aligned
    cells: Box<[u64]>,
}

impl Block {
    fn new() -> Block {
        Block {
            cells: vec![0u64; BLOCK_WORDS / 2].into_boxed_slice(),
        }
    }

    #[inline]
    fn base(&self) -> *mut u32 {
        self.cells.as_ptr() as *mut u32
    }
}

/// Writes instructions into a chain of blocks. Every instruction is
/// staged field-first and made visible with a release swap of its flags
/// word, so the executor can consume the stream while it is still being
/// written.
pub(crate) struct Encoder {
    blocks: Vec<Block>,
    pos: usize,
    wake: bool,
}

pub(crate) struct KeyedOp<'a> {
    pub flags: u32,
    pub dbi: u32,
    pub key: &'a [u8],
    pub value: Option<(u64, u32)>,
    pub slot_seed: Option<u64>,
    pub cond_version: Option<f64>,
    pub set_version: Option<f64>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            blocks: vec![Block::new()],
            pos: 0,
            wake: false,
        }
    }

    /// Address of the first instruction word.
    pub fn head(&self) -> *mut u32 {
        self.blocks[0].base()
    }

    /// True when the executor parked on a word this encoder just
    /// published; the caller signals the environment. Reading resets the
    /// flag.
    pub fn take_wake(&mut self) -> bool {
        let wake = self.wake;
        self.wake = false;
        wake
    }

    /// Encode a keyed instruction and return its flags-word address and,
    /// for compressible values, the address of the status slot.
    pub fn push_keyed(
        &mut self,
        op: &KeyedOp,
    ) -> Result<(*mut u32, Option<*mut u64>)> {
        let key_len = op.key.len();
        // key field plus padding up to the aligned value region
        let region_words = ((28 + key_len) & !7) / 4;
        let mut words = region_words;
        if op.value.is_some() {
            words += if op.slot_seed.is_some() { 4 } else { 2 };
        }
        if op.cond_version.is_some() {
            words += 2;
        }
        if op.set_version.is_some() {
            words += 2;
        }

        let base = self.reserve(words)?;
        let mut slot = None;
        unsafe {
            *base.add(1) = op.dbi;
            *base.add(2) = key_len as u32;
            ptr::copy_nonoverlapping(
                op.key.as_ptr(),
                base.add(3) as *mut u8,
                key_len,
            );
            let mut field = base.add(region_words);
            if let Some((value_ptr, value_len)) = op.value {
                *field.offset(-1) = value_len;
                *(field as *mut u64) = value_ptr;
                field = field.add(2);
                if let Some(seed) = op.slot_seed {
                    *(field as *mut u64) = seed;
                    slot = Some(field as *mut u64);
                    field = field.add(2);
                }
            }
            if let Some(version) = op.cond_version {
                *(field as *mut f64) = version;
                field = field.add(2);
            }
            if let Some(version) = op.set_version {
                *(field as *mut f64) = version;
            }
        }
        self.publish(base, op.flags)?;
        Ok((base, slot))
    }

    /// Encode a keyless instruction, optionally carrying an 8-byte
    /// payload.
    pub fn push_keyless(
        &mut self,
        flags: u32,
        payload: Option<u64>,
    ) -> Result<*mut u32> {
        let words = if payload.is_some() { 4 } else { 2 };
        let base = self.reserve(words)?;
        unsafe {
            *base.add(1) = 0;
            if let Some(payload) = payload {
                *(base.add(2) as *mut u64) = payload;
            }
        }
        self.publish(base, flags)?;
        Ok(base)
    }

    // Make room for `words` more words, chaining to a fresh block when the
    // current one is nearly full. Four spare words always remain after an
    // instruction so the chain pointer (or the stream delimiter) fits.
    fn reserve(&mut self, words: usize) -> Result<*mut u32> {
        debug_assert!(words % 2 == 0);
        if words + 4 > BLOCK_WORDS {
            return Err(Error::InvalidOption("key"));
        }
        if self.pos + words + 4 > BLOCK_WORDS {
            let next = Block::new();
            let next_base = next.base() as u64;
            let chain =
                unsafe { self.blocks.last().unwrap().base().add(self.pos) };
            unsafe {
                *chain.add(1) = 0;
                *(chain.add(2) as *mut u64) = next_base;
            }
            self.blocks.push(next);
            self.pos = 0;
            self.publish(chain, POINTER_NEXT)?;
        }
        let base = unsafe { self.blocks.last().unwrap().base().add(self.pos) };
        self.pos += words;
        Ok(base)
    }

    // Flip the flags word last, making the instruction visible to the
    // executor.
    fn publish(&mut self, word: *mut u32, flags: u32) -> Result<()> {
        let atomic = unsafe { &*(word as *const AtomicU32) };
        let prev = atomic.swap(flags, Ordering::AcqRel);
        if prev & ENDED_BITS != 0 {
            // the batch transaction was delimited at this word; restore
            // the marker, this instruction will never run
            atomic.fetch_or(prev, Ordering::AcqRel);
            return Err(Error::BatchCommitted);
        }
        if prev & WAITING_OPERATION != 0 {
            self.wake = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_layout_matches_decoder_expectations() {
        let mut enc = Encoder::new();
        let value = b"world".to_vec();
        let (base, slot) = enc
            .push_keyed(&KeyedOp {
                flags: PUT,
                dbi: 7,
                key: b"hello",
                value: Some((value.as_ptr() as u64, value.len() as u32)),
                slot_seed: None,
                cond_version: None,
                set_version: Some(2.5),
            })
            .unwrap();
        assert!(slot.is_none());
        assert_eq!(base as usize % 8, 0);
        unsafe {
            assert_eq!(*base, PUT);
            assert_eq!(*base.add(1), 7);
            assert_eq!(*base.add(2), 5);
            let key =
                std::slice::from_raw_parts(base.add(3) as *const u8, 5);
            assert_eq!(key, b"hello");

            // the decoder's walk: skip key plus slack, align down to 8
            let region = ((base.add(3) as usize + 5 + 16) & !7) as *mut u32;
            assert!(region as usize - (base.add(3) as usize + 5) >= 16 - 7);
            assert_eq!(region as usize % 8, 0);
            assert_eq!(*region.offset(-1), 5);
            assert_eq!(*(region as *const u64), value.as_ptr() as u64);
            assert_eq!(*(region.add(2) as *const f64), 2.5);
        }
    }

    #[test]
    fn keyless_layout() {
        let mut enc = Encoder::new();
        let word = enc.push_keyless(BLOCK_END, None).unwrap();
        unsafe {
            assert_eq!(*word, BLOCK_END);
        }
        let next = enc.push_keyless(START_BLOCK, None).unwrap();
        assert_eq!(next as usize, word as usize + 8);
    }

    #[test]
    fn stream_chains_into_fresh_blocks() {
        let mut enc = Encoder::new();
        let head = enc.head();
        let mut last = head;
        for _ in 0..BLOCK_WORDS {
            last = enc.push_keyless(START_BLOCK, None).unwrap();
        }
        // the stream left the first block at some point
        let head_block = head as usize..head as usize + BLOCK_WORDS * 4;
        assert!(!head_block.contains(&(last as usize)));

        // walk the chain like the executor does
        let mut cursor = head;
        let mut seen = 0;
        loop {
            let flags = unsafe { *cursor };
            match flags & OPCODE_MASK {
                START_BLOCK => {
                    seen += 1;
                    cursor = unsafe { cursor.add(2) };
                }
                POINTER_NEXT => {
                    cursor = unsafe {
                        *(cursor.add(2) as *const u64) as usize as *mut u32
                    };
                }
                NO_INSTRUCTION_YET => break,
                other => panic!("unexpected opcode {}", other),
            }
        }
        assert_eq!(seen, BLOCK_WORDS);
    }

    #[test]
    fn publish_reports_parked_executor() {
        let mut enc = Encoder::new();
        let head = enc.head();
        unsafe { &*(head as *const AtomicU32) }
            .store(WAITING_OPERATION, Ordering::Release);
        enc.push_keyless(START_BLOCK, None).unwrap();
        assert!(enc.take_wake());
        assert!(!enc.take_wake());
    }

    #[test]
    fn publish_detects_finished_batch() {
        let mut enc = Encoder::new();
        let head = enc.head();
        unsafe { &*(head as *const AtomicU32) }
            .store(TXN_DELIMITER | TXN_COMMITTED, Ordering::Release);
        assert_eq!(
            enc.push_keyless(START_BLOCK, None).unwrap_err(),
            Error::BatchCommitted
        );
        // the delimiter bits survive for late observers
        let word = unsafe { &*(head as *const AtomicU32) }.load(Ordering::Acquire);
        assert!(word & TXN_DELIMITER != 0);
        assert!(word & TXN_COMMITTED != 0);
    }
}
