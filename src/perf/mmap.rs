//! Utilities to read sampled events from memory mapped ring buffer.

use crate::perf::ffi;
use crate::util::PAGE_SIZE;
use crate::{Error, Result};
use byteorder::{NativeEndian, ReadBytesExt};
use derive_more::{Deref, DerefMut, From, IntoIterator};
use nix::sys::mman;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, Ordering};

/// Size of `perf_event_header` on the wire.
const HEADER_SIZE: usize = 8;

/// Values extracted from one drain of a ring buffer.
///
/// Records are flattened in order: `{ip}` for instruction pointer samplers and `{ip, v1..vN}` for
/// group samplers.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deref, DerefMut, From, IntoIterator)]
#[into_iterator(owned, ref)]
pub struct SampleList(Vec<u64>);

impl SampleList {
    /// Consume the list into its raw values.
    pub fn into_inner(self) -> Vec<u64> {
        self.0
    }
}

/// Payload layout of `PERF_RECORD_SAMPLE` records in a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleLayout {
    /// `PERF_SAMPLE_IP` is set.
    pub ip: bool,
    /// `PERF_SAMPLE_READ` is set.
    pub read: bool,
    /// `PERF_FORMAT_GROUP` is set, so reads carry a count followed by that many values.
    pub group: bool,
}

/// Userspace wrapper for the sampled/mmaped perf events.
///
/// Memory layout:
/// ```text
/// ┌───── header ─────┐  ▲
/// │                  │  │
/// │ perf_event_mmap  │ pagesize
/// │      _page       │  │
/// │                  │  ▼
/// ├─────  base  ─────┤  ▲
/// │                  │  │
/// │                  │ size = npages * pagesize
/// │      Events      │  │
/// │                  │  │
/// └──────────────────┘  ▼
/// ```
#[derive(Debug)]
pub struct RingBuffer {
    /// Metadata of the ring buffer.
    header: *mut ffi::perf_event_mmap_page,
    /// The size of the allocation made using `mmap`.
    total_alloc_size: usize,
    /// Size in bytes of the event records in the ring buffer.
    size: usize,
    /// Pointer to the beginning of the event records.
    base: *mut u8,
    /// Last consumed position (unwrapped).
    prev: u64,
    /// Drains cut short by a malformed record since the last `take_malformed`.
    malformed: u64,
}

// The mapping is owned by this value and only touched through `&mut self`.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Map `npages` data pages plus the metadata page of the perf event `fd`.
    ///
    /// `npages` must be a power of two.
    pub fn new(fd: RawFd, npages: usize) -> Result<Self> {
        if npages == 0 || !npages.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let size = npages * *PAGE_SIZE;
        let total_alloc_size = size + *PAGE_SIZE;
        let len = NonZeroUsize::new(total_alloc_size).ok_or(Error::InvalidArgument)?;
        let header = unsafe {
            mman::mmap(
                None,
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|_| Error::OutOfMemory)? as *mut ffi::perf_event_mmap_page;
        let base = unsafe { (header as *mut u8).add(*PAGE_SIZE) };
        Ok(RingBuffer {
            header,
            total_alloc_size,
            size,
            base,
            prev: 0,
            malformed: 0,
        })
    }

    /// Size in bytes of the data area.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.size
    }

    /// Size in bytes of the whole mapping, metadata page included.
    #[inline]
    pub fn mapped_size(&self) -> usize {
        self.total_alloc_size
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { std::ptr::read_volatile(&(*self.header).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn write_tail(&mut self, tail: u64) {
        fence(Ordering::SeqCst);
        unsafe { std::ptr::write_volatile(&mut (*self.header).data_tail, tail) };
    }

    /// Consume every complete record between the last tail and the kernel's head.
    ///
    /// Returns `None` while fewer than `watermark` bytes are pending.
    pub fn drain(&mut self, watermark: u64, layout: SampleLayout) -> Option<SampleList> {
        let head = self.read_head();
        let data = unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) };
        let mut tail = self.prev;
        let (out, clean) = drain_checked(data, head, &mut tail, watermark, layout);
        if !clean {
            self.malformed += 1;
        }
        if tail != self.prev {
            self.prev = tail;
            self.write_tail(tail);
        }
        out
    }

    /// Number of drains that stopped at a malformed record, resetting the count.
    ///
    /// Draining runs in signal context and never logs, so callers report this later.
    pub fn take_malformed(&mut self) -> u64 {
        std::mem::replace(&mut self.malformed, 0)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.header as *mut std::ffi::c_void, self.total_alloc_size);
        }
    }
}

/// Drain the records of `data` found between `*tail` and `head`.
///
/// `data` is the data area of a ring buffer and its length must be a power of two. On return
/// `*tail` has been advanced to `head` whenever the pending region was consumed or discarded.
pub fn drain_samples(
    data: &[u8],
    head: u64,
    tail: &mut u64,
    watermark: u64,
    layout: SampleLayout,
) -> Option<SampleList> {
    drain_checked(data, head, tail, watermark, layout).0
}

/// Same as `drain_samples`, also telling whether every record parsed.
fn drain_checked(
    data: &[u8],
    head: u64,
    tail: &mut u64,
    watermark: u64,
    layout: SampleLayout,
) -> (Option<SampleList>, bool) {
    let size = head.wrapping_sub(*tail);
    if size < watermark {
        return (None, true);
    }
    let mut out = SampleList::default();
    if size == 0 {
        return (Some(out), true);
    }
    if size > data.len() as u64 {
        // The kernel lapped us; everything pending is garbage.
        *tail = head;
        return (Some(out), true);
    }

    let buf = copy_wrapped(data, *tail, size as usize);
    let clean = parse_records(&buf, layout, &mut out);
    *tail = head;
    (Some(out), clean)
}

/// Linearize `len` bytes starting at the unwrapped offset `tail`.
fn copy_wrapped(data: &[u8], tail: u64, len: usize) -> Vec<u8> {
    let mask = data.len() as u64 - 1;
    let start = (tail & mask) as usize;
    let mut buf = Vec::with_capacity(len);
    if start + len <= data.len() {
        buf.extend_from_slice(&data[start..start + len]);
    } else {
        let upper = data.len() - start;
        buf.extend_from_slice(&data[start..]);
        buf.extend_from_slice(&data[..len - upper]);
    }
    buf
}

/// Parse records until the end of `buf`. Returns `false` if a malformed record stopped it.
fn parse_records(buf: &[u8], layout: SampleLayout, out: &mut SampleList) -> bool {
    let mut cur = Cursor::new(buf);
    while cur.position() as usize + HEADER_SIZE <= buf.len() {
        match parse_record(&mut cur, buf.len() as u64, layout, out) {
            Ok(Some(end)) => cur.set_position(end),
            _ => return false,
        }
    }
    true
}

/// Parse one record at the cursor, returning the offset of the next record.
fn parse_record(
    cur: &mut Cursor<&[u8]>,
    limit: u64,
    layout: SampleLayout,
    out: &mut SampleList,
) -> std::io::Result<Option<u64>> {
    let start = cur.position();
    let type_ = cur.read_u32::<NativeEndian>()?;
    let _misc = cur.read_u16::<NativeEndian>()?;
    let size = u64::from(cur.read_u16::<NativeEndian>()?);
    let end = start + size;
    if size < HEADER_SIZE as u64 || end > limit {
        return Ok(None);
    }
    if type_ != ffi::PERF_RECORD_SAMPLE as u32 {
        return Ok(Some(end));
    }

    if layout.ip {
        out.push(cur.read_u64::<NativeEndian>()?);
    }
    if layout.read {
        if layout.group {
            let nr = cur.read_u64::<NativeEndian>()?;
            if nr > (end.saturating_sub(cur.position())) / 8 {
                return Ok(None);
            }
            for _ in 0..nr {
                out.push(cur.read_u64::<NativeEndian>()?);
            }
        } else {
            out.push(cur.read_u64::<NativeEndian>()?);
        }
    }
    if cur.position() > end {
        return Ok(None);
    }
    Ok(Some(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: SampleLayout = SampleLayout {
        ip: true,
        read: true,
        group: true,
    };
    const IP: SampleLayout = SampleLayout {
        ip: true,
        read: false,
        group: false,
    };

    fn record(type_: u32, payload: &[u64]) -> Vec<u8> {
        let size = (HEADER_SIZE + payload.len() * 8) as u16;
        let mut rec = Vec::new();
        rec.extend_from_slice(&type_.to_ne_bytes());
        rec.extend_from_slice(&0u16.to_ne_bytes());
        rec.extend_from_slice(&size.to_ne_bytes());
        for v in payload {
            rec.extend_from_slice(&v.to_ne_bytes());
        }
        rec
    }

    fn place(data: &mut [u8], at: u64, bytes: &[u8]) {
        let mask = data.len() as u64 - 1;
        for (i, b) in bytes.iter().enumerate() {
            data[((at + i as u64) & mask) as usize] = *b;
        }
    }

    #[test]
    fn test_drain_group_samples() {
        let mut data = vec![0u8; 128];
        let mut recs = record(ffi::PERF_RECORD_SAMPLE as u32, &[0x4000, 2, 10, 20]);
        recs.extend(record(ffi::PERF_RECORD_LOST as u32, &[1, 1]));
        recs.extend(record(ffi::PERF_RECORD_SAMPLE as u32, &[0x4010, 2, 11, 21]));
        place(&mut data, 0, &recs);

        let mut tail = 0;
        let out = drain_samples(&data, recs.len() as u64, &mut tail, 0, GROUP).unwrap();
        assert_eq!(out.into_inner(), vec![0x4000, 10, 20, 0x4010, 11, 21]);
        assert_eq!(tail, recs.len() as u64);
    }

    #[test]
    fn test_drain_wraps_around() {
        let mut data = vec![0u8; 64];
        let rec = record(ffi::PERF_RECORD_SAMPLE as u32, &[0xdead, 0xbeef]);
        let mut tail = 48;
        place(&mut data, tail, &rec);

        let head = tail + rec.len() as u64;
        let out = drain_samples(&data, head, &mut tail, 0, IP).unwrap();
        assert_eq!(out.as_slice(), &[0xdead]);
        assert_eq!(tail, head);
    }

    #[test]
    fn test_drain_below_watermark() {
        let data = vec![0u8; 64];
        let mut tail = 8;
        assert!(drain_samples(&data, 24, &mut tail, 32, IP).is_none());
        assert_eq!(tail, 8);
    }

    #[test]
    fn test_drain_empty() {
        let data = vec![0u8; 64];
        let mut tail = 16;
        let out = drain_samples(&data, 16, &mut tail, 0, IP).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_drain_overflow_snaps_tail() {
        let mut data = vec![0u8; 64];
        place(&mut data, 0, &record(ffi::PERF_RECORD_SAMPLE as u32, &[0x1]));

        let mut tail = 0;
        let head = 200;
        let out = drain_samples(&data, head, &mut tail, 0, IP).unwrap();
        assert!(out.is_empty());
        assert_eq!(tail, head);

        // Recovery starts cleanly from the snapped tail.
        let rec = record(ffi::PERF_RECORD_SAMPLE as u32, &[0x77]);
        place(&mut data, head, &rec);
        let next = head + rec.len() as u64;
        let out = drain_samples(&data, next, &mut tail, 0, IP).unwrap();
        assert_eq!(out.as_slice(), &[0x77]);
        assert_eq!(tail, next);
    }

    #[test]
    fn test_drain_stops_on_corrupt_header() {
        let mut data = vec![0u8; 64];
        let mut recs = record(ffi::PERF_RECORD_SAMPLE as u32, &[0x10]);
        // A zero sized header cannot be stepped over.
        recs.extend_from_slice(&[9, 0, 0, 0, 0, 0, 0, 0]);
        recs.extend(record(ffi::PERF_RECORD_SAMPLE as u32, &[0x20]));
        place(&mut data, 0, &recs);

        let mut tail = 0;
        let (out, clean) = drain_checked(&data, recs.len() as u64, &mut tail, 0, IP);
        assert_eq!(out.unwrap().as_slice(), &[0x10]);
        assert!(!clean);
        assert_eq!(tail, recs.len() as u64);

        // The next region is intact again.
        let rec = record(ffi::PERF_RECORD_SAMPLE as u32, &[0x30]);
        place(&mut data, tail, &rec);
        let head = tail + rec.len() as u64;
        let (out, clean) = drain_checked(&data, head, &mut tail, 0, IP);
        assert_eq!(out.unwrap().as_slice(), &[0x30]);
        assert!(clean);
    }

    #[test]
    fn test_drain_group_count_overrun() {
        let mut data = vec![0u8; 64];
        // Claims four group values but carries one.
        let recs = record(ffi::PERF_RECORD_SAMPLE as u32, &[0x40, 4, 1]);
        place(&mut data, 0, &recs);

        let mut tail = 0;
        let (out, clean) = drain_checked(&data, recs.len() as u64, &mut tail, 0, GROUP);
        assert_eq!(out.unwrap().as_slice(), &[0x40]);
        assert!(!clean);
    }
}
