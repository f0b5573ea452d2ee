//! Dictionary-based LZ4 value compression.
//!
//! Stored values keep their first byte as a status marker: 0..=249 means
//! the record is raw, 0xFE/0xFF mean compressed with a short or long
//! length header. Raw values that happen to start with a reserved byte are
//! therefore always compressed, so decoding stays unambiguous.
//!
//! The LZ4 library itself is linked in through the `lzzzz` crate; the
//! dictionary streaming entry points it does not re-export are declared
//! here directly.

use std::any::Any;
use std::cell::Cell;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use lzzzz::lz4::max_compressed_size;

use crate::env::EnvInner;
use crate::error::{Error, Result};

/// Compressed record, uncompressed length < 2^24.
pub(crate) const SENTINEL_SHORT: u8 = 0xfe;
/// Compressed record, long length header.
pub(crate) const SENTINEL_LONG: u8 = 0xff;
/// First bytes at or above this are reserved for the compression
/// envelope; raw values starting with them must be compressed.
pub(crate) const SENTINEL_MIN: u8 = 250;

const DEFAULT_THRESHOLD: usize = 1000;
const DEFAULT_TARGET_SIZE: usize = 1 << 20;

extern "C" {
    fn LZ4_createStream() -> *mut c_void;
    fn LZ4_loadDict(
        stream: *mut c_void,
        dict: *const c_char,
        dict_size: c_int,
    ) -> c_int;
    fn LZ4_compress_fast_continue(
        stream: *mut c_void,
        src: *const c_char,
        dst: *mut c_char,
        src_size: c_int,
        dst_capacity: c_int,
        acceleration: c_int,
    ) -> c_int;
    fn LZ4_decompress_safe_usingDict(
        src: *const c_char,
        dst: *mut c_char,
        compressed_size: c_int,
        dst_capacity: c_int,
        dict_start: *const c_char,
        dict_size: c_int,
    ) -> c_int;
}

thread_local! {
    // one LZ4 stream per thread, reused across compress calls
    static STREAM: Cell<*mut c_void> = Cell::new(ptr::null_mut());
}

/// Options for value compression on an environment.
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    /// Dictionary preloaded into the LZ4 stream for every compression and
    /// decompression. May be empty.
    pub dictionary: Vec<u8>,
    /// Values shorter than this are stored raw (unless their first byte is
    /// a reserved sentinel).
    pub threshold: usize,
    /// Size of the decompression target buffer, bounding the largest
    /// decompressible value.
    pub target_size: usize,
    /// LZ4 acceleration factor.
    pub acceleration: i32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            dictionary: Vec::new(),
            threshold: DEFAULT_THRESHOLD,
            target_size: DEFAULT_TARGET_SIZE,
            acceleration: 1,
        }
    }
}

/// Compression context of an environment: the dictionary and the
/// decompression target live in one contiguous buffer, target right after
/// dictionary.
pub struct Compression {
    buf: Mutex<Box<[u8]>>,
    dict_size: usize,
    threshold: usize,
    acceleration: c_int,
}

impl Compression {
    pub(crate) fn new(opts: &CompressionOptions) -> Result<Compression> {
        if opts.target_size == 0 {
            return Err(Error::InvalidOption("target_size"));
        }
        if opts.acceleration < 1 {
            return Err(Error::InvalidOption("acceleration"));
        }
        // keep the dictionary word-aligned
        let dict_size = (opts.dictionary.len() >> 3) << 3;
        let mut buf = vec![0u8; dict_size + opts.target_size];
        buf[..dict_size].copy_from_slice(&opts.dictionary[..dict_size]);
        Ok(Compression {
            buf: Mutex::new(buf.into_boxed_slice()),
            dict_size,
            threshold: opts.threshold,
            acceleration: opts.acceleration as c_int,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether a value of this shape is stored through the compression
    /// envelope.
    pub(crate) fn wants_compression(&self, value: &[u8]) -> bool {
        value.len() >= self.threshold
            || (!value.is_empty() && value[0] >= SENTINEL_MIN)
    }

    /// Compress `value` into a freshly allocated buffer carrying the
    /// sentinel header. `None` means the value should be stored raw:
    /// either it is below the threshold or LZ4 declined to compress it.
    pub(crate) fn compress(&self, value: &[u8]) -> Option<Box<[u8]>> {
        if !self.wants_compression(value) {
            return None;
        }
        let long = value.len() >= 0x0100_0000;
        let prefix = if long { 8 } else { 4 };
        let mut out = vec![0u8; max_compressed_size(value.len()) + prefix];

        let buf = self.buf.lock().unwrap();
        let written = STREAM.with(|cell| {
            let mut stream = cell.get();
            if stream.is_null() {
                stream = unsafe { LZ4_createStream() };
                cell.set(stream);
            }
            unsafe {
                LZ4_loadDict(
                    stream,
                    buf.as_ptr() as *const c_char,
                    self.dict_size as c_int,
                );
                LZ4_compress_fast_continue(
                    stream,
                    value.as_ptr() as *const c_char,
                    out.as_mut_ptr().add(prefix) as *mut c_char,
                    value.len() as c_int,
                    (out.len() - prefix) as c_int,
                    self.acceleration,
                )
            }
        });
        drop(buf);

        if written <= 0 {
            return None;
        }
        let len = value.len();
        if long {
            out[0] = SENTINEL_LONG;
            out[2] = (len >> 40) as u8;
            out[3] = (len >> 32) as u8;
            out[4] = (len >> 24) as u8;
            out[5] = (len >> 16) as u8;
            out[6] = (len >> 8) as u8;
            out[7] = len as u8;
        } else {
            out[0] = SENTINEL_SHORT;
            out[1] = (len >> 16) as u8;
            out[2] = (len >> 8) as u8;
            out[3] = len as u8;
        }
        out.truncate(prefix + written as usize);
        Some(out.into_boxed_slice())
    }

    /// Decompress a stored record carrying a sentinel header. The output
    /// is produced in the shared decompression target and copied out.
    pub(crate) fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(Error::Decompress);
        }
        let (uncompressed_len, header) = match data[0] {
            SENTINEL_SHORT => {
                if data.len() < 4 {
                    return Err(Error::Decompress);
                }
                let len = ((data[1] as usize) << 16)
                    | ((data[2] as usize) << 8)
                    | data[3] as usize;
                (len, 4)
            }
            SENTINEL_LONG => {
                if data.len() < 8 {
                    return Err(Error::Decompress);
                }
                let len = ((data[2] as usize) << 40)
                    | ((data[3] as usize) << 32)
                    | ((data[4] as usize) << 24)
                    | ((data[5] as usize) << 16)
                    | ((data[6] as usize) << 8)
                    | data[7] as usize;
                (len, 8)
            }
            byte => return Err(Error::BadSentinel(byte)),
        };

        let mut buf = self.buf.lock().unwrap();
        let dict_size = self.dict_size;
        let (dict, target) = buf.split_at_mut(dict_size);
        if uncompressed_len > target.len() {
            return Err(Error::DecompressTooLarge);
        }
        let written = unsafe {
            LZ4_decompress_safe_usingDict(
                data.as_ptr().add(header) as *const c_char,
                target.as_mut_ptr() as *mut c_char,
                (data.len() - header) as c_int,
                uncompressed_len as c_int,
                dict.as_ptr() as *const c_char,
                dict_size as c_int,
            )
        };
        if written != uncompressed_len as c_int {
            return Err(Error::Decompress);
        }
        Ok(target[..uncompressed_len].to_vec())
    }

    /// Compress the value an instruction points at, in place.
    ///
    /// `slot` is the instruction's 8-byte status word; the value pointer
    /// sits in the 8 bytes before it and the value length in the 32-bit
    /// word before that. After replacing pointer and length the status is
    /// swapped to 0; a previous status of 1 means the write worker is
    /// blocked on this instruction and gets signalled.
    ///
    /// The caller guarantees the instruction stays alive and the pointers
    /// are valid.
    pub(crate) unsafe fn compress_instruction(
        &self,
        env: Option<&EnvInner>,
        slot: *mut u64,
    ) {
        let len_ptr = (slot as *mut u32).offset(-3);
        let value_ptr = slot.offset(-1);
        let raw = slice::from_raw_parts(
            *value_ptr as usize as *const u8,
            *len_ptr as usize,
        );

        // when LZ4 declines, re-store the raw bytes in an owned buffer so
        // cleanup stays uniform for every compressible instruction
        let out = match self.compress(raw) {
            Some(compressed) => compressed,
            None => raw.to_vec().into_boxed_slice(),
        };

        *len_ptr = out.len() as u32;
        *value_ptr = Box::into_raw(out) as *mut u8 as u64;

        let status = (*(slot as *const AtomicU64)).swap(0, Ordering::AcqRel);
        if status == 1 {
            if let Some(env) = env {
                let _guard = env.writing.lock();
                env.writing.notify_all();
            }
        }
    }
}

/// Free a buffer produced by `compress_instruction`.
pub(crate) unsafe fn free_compressed(ptr: *mut u8, len: usize) {
    drop(Box::from_raw(slice::from_raw_parts_mut(ptr, len) as *mut [u8]));
}

#[derive(Clone, Copy)]
struct SlotPtr(*mut u64);

unsafe impl Send for SlotPtr {}

struct CompressJob {
    env: Arc<EnvInner>,
    slot: SlotPtr,
    // keeps the instruction stream alive until the job ran, even when the
    // executor already claimed the slot itself
    _owner: Arc<dyn Any + Send + Sync>,
}

lazy_static! {
    static ref COMPRESS_POOL: Sender<CompressJob> = start_pool();
}

fn start_pool() -> Sender<CompressJob> {
    let (tx, rx) = unbounded::<CompressJob>();
    let workers = num_cpus::get().min(4).max(1);
    for i in 0..workers {
        let rx = rx.clone();
        thread::Builder::new()
            .name(format!("batchdb-compress-{}", i))
            .spawn(move || {
                for job in rx.iter() {
                    unsafe {
                        let slot = &*(job.slot.0 as *const AtomicU64);
                        let prev = slot.swap(2, Ordering::AcqRel);
                        if prev > 2 {
                            // the slot held the compressor address, the
                            // instruction is ours to compress
                            let compression =
                                &*(prev as usize as *const Compression);
                            compression
                                .compress_instruction(Some(&job.env), job.slot.0);
                        }
                    }
                }
            })
            .expect("spawn compression worker");
    }
    tx
}

/// Queue an instruction's status slot for background compression.
pub(crate) fn queue_compression(
    env: &Arc<EnvInner>,
    slot: *mut u64,
    owner: Arc<dyn Any + Send + Sync>,
) {
    COMPRESS_POOL
        .send(CompressJob {
            env: env.clone(),
            slot: SlotPtr(slot),
            _owner: owner,
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(threshold: usize) -> Compression {
        let opts = CompressionOptions {
            dictionary: vec![0u8; 4096],
            threshold,
            target_size: 1 << 16,
            acceleration: 1,
        };
        Compression::new(&opts).unwrap()
    }

    #[test]
    fn below_threshold_stays_raw() {
        let compression = setup(16);
        assert!(compression.compress(b"short").is_none());
    }

    #[test]
    fn roundtrip() {
        let compression = setup(16);
        let value = vec![b'A'; 8192];
        let stored = compression.compress(&value).unwrap();
        assert_eq!(stored[0], SENTINEL_SHORT);
        assert!(stored.len() < value.len());
        assert_eq!(compression.decompress(&stored).unwrap(), value);
    }

    #[test]
    fn reserved_first_byte_forces_compression() {
        let compression = setup(1000);
        // two bytes, way below threshold, but 0xfb is reserved
        let value = [0xfbu8, 0x01];
        let stored = compression.compress(&value).unwrap();
        assert!(stored[0] == SENTINEL_SHORT || stored[0] == SENTINEL_LONG);
        assert_eq!(compression.decompress(&stored).unwrap(), value);
    }

    #[test]
    fn decompress_rejects_unknown_sentinel() {
        let compression = setup(16);
        assert_eq!(
            compression.decompress(&[250, 0, 0, 0]).unwrap_err(),
            Error::BadSentinel(250)
        );
    }

    #[test]
    fn decompress_rejects_oversized_length() {
        let compression = setup(16);
        // short header claiming 1 MiB, larger than the 64 KiB target
        let stored = [SENTINEL_SHORT, 0x10, 0, 0, 0];
        assert_eq!(
            compression.decompress(&stored).unwrap_err(),
            Error::DecompressTooLarge
        );
    }

    #[test]
    fn random_values_roundtrip() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let compression = setup(8);
        for _ in 0..50 {
            let len = rng.gen_range(8..4096);
            // skewed bytes so LZ4 finds matches most of the time
            let value: Vec<u8> =
                (0..len).map(|_| rng.gen_range(0..8) as u8).collect();
            match compression.compress(&value) {
                Some(stored) => {
                    assert_eq!(compression.decompress(&stored).unwrap(), value)
                }
                None => assert!(value[0] < SENTINEL_MIN),
            }
        }
    }
}
