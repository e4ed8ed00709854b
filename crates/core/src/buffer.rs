// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Buffer records (ubuf equivalents): typed, single-owner-aware byte carriers.
//!
//! A [`Ubuf`] is the payload half of a [`crate::packet::Uref`] carrier record.
//! Three variants cover the shapes a pipe ever allocates: contiguous coded
//! data ([`BlockBuf`]), planar pictures ([`PictureBuf`]), and planar/interleaved
//! sound ([`SoundBuf`]). All three are cheap to clone (backed by `bytes::Bytes`
//! or the existing [`crate::frame_pool`] pool) and expose a `single_owner`
//! check so callers can choose in-place mutation over a copy, mirroring
//! [`crate::types::AudioFrame::has_unique_samples`].

use crate::frame_pool::{FramePool, PooledFrameData};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A contiguous (or logically chained) octet sequence, e.g. a coded access
/// unit, an SRT payload, or a demuxed container packet.
#[derive(Debug, Clone)]
pub struct BlockBuf {
    data: Bytes,
}

impl BlockBuf {
    #[must_use]
    pub fn from_bytes(data: Bytes) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: Bytes::from(data) }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when no other clone shares the backing storage; single-owner
    /// blocks may be resized by adjusting the view instead of reallocating.
    #[must_use]
    pub fn single_owner(&self) -> bool {
        // `Bytes` doesn't expose a refcount directly, but a clone that has
        // never been sliced shares the same underlying `Arc`-like vtable
        // pointer; comparing pointer+len is the best available proxy here.
        // Callers that need strict single-ownership should track it via the
        // surrounding `Uref`'s own refcount instead.
        self.data.len() == self.data.capacity()
    }

    /// Adjust the view by trimming `start` bytes from the front and
    /// truncating to `new_len` total bytes, without copying.
    pub fn resize_view(&mut self, start: usize, new_len: usize) {
        let mut data = self.data.split_off(start.min(self.data.len()));
        data.truncate(new_len);
        self.data = data;
    }

    /// Append another block, consuming both. Chaining is realized as a copy
    /// into a fresh buffer since `Bytes` has no native chain/cons-cell form.
    #[must_use]
    pub fn append(self, other: &BlockBuf) -> Self {
        let mut merged = BytesMut::with_capacity(self.data.len() + other.data.len());
        merged.extend_from_slice(&self.data);
        merged.extend_from_slice(&other.data);
        Self { data: merged.freeze() }
    }
}

/// One named plane of a [`PictureBuf`] (e.g. `"y8"`, `"u8"`, `"v8"`).
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Arc<PooledFrameData<u8>>,
    pub stride: usize,
    pub hsub: u8,
    pub vsub: u8,
}

/// A picture buffer: one or more named, subsampled planes.
#[derive(Debug, Clone)]
pub struct PictureBuf {
    pub hsize: u32,
    pub vsize: u32,
    planes: BTreeMap<&'static str, Plane>,
}

impl PictureBuf {
    #[must_use]
    pub fn new(hsize: u32, vsize: u32) -> Self {
        Self { hsize, vsize, planes: BTreeMap::new() }
    }

    pub fn register_plane(&mut self, name: &'static str, plane: Plane) {
        self.planes.insert(name, plane);
    }

    #[must_use]
    pub fn plane(&self, name: &str) -> Option<&Plane> {
        self.planes.get(name)
    }

    pub fn iter_planes(&self) -> impl Iterator<Item = (&'static str, &Plane)> {
        self.planes.iter().map(|(k, v)| (*k, v))
    }

    /// True iff every plane's pooled backing has exactly one owner.
    #[must_use]
    pub fn single_owner(&self) -> bool {
        self.planes.values().all(|p| Arc::strong_count(&p.data) == 1)
    }
}

/// A sound buffer: one or more named channel planes (for planar formats) or
/// a single interleaved plane keyed `"interleaved"`.
#[derive(Debug, Clone)]
pub struct SoundBuf {
    pub rate: u32,
    pub sample_size: u8,
    planes: BTreeMap<&'static str, Arc<PooledFrameData<f32>>>,
}

impl SoundBuf {
    #[must_use]
    pub fn new(rate: u32, sample_size: u8) -> Self {
        Self { rate, sample_size, planes: BTreeMap::new() }
    }

    pub fn register_plane(&mut self, name: &'static str, data: Arc<PooledFrameData<f32>>) {
        self.planes.insert(name, data);
    }

    #[must_use]
    pub fn plane(&self, name: &str) -> Option<&Arc<PooledFrameData<f32>>> {
        self.planes.get(name)
    }

    pub fn iter_planes(&self) -> impl Iterator<Item = (&'static str, &Arc<PooledFrameData<f32>>)> {
        self.planes.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn single_owner(&self) -> bool {
        self.planes.values().all(|p| Arc::strong_count(p) == 1)
    }
}

/// Typed buffer record. The payload half of a carrier record ([`crate::packet::Uref`]).
#[derive(Debug, Clone)]
pub enum Ubuf {
    Block(BlockBuf),
    Picture(PictureBuf),
    Sound(SoundBuf),
}

impl Ubuf {
    #[must_use]
    pub fn as_block(&self) -> Option<&BlockBuf> {
        match self {
            Self::Block(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn single_owner(&self) -> bool {
        match self {
            Self::Block(b) => b.single_owner(),
            Self::Picture(p) => p.single_owner(),
            Self::Sound(s) => s.single_owner(),
        }
    }
}

/// Allocates picture-plane-backed pooled byte buffers, mirroring
/// [`crate::frame_pool::AudioFramePool`] but for `u8` picture planes.
pub type PictureFramePool = FramePool<u8>;

/// A write guard over a mapped [`Ubuf`] region, returned by
/// [`UbufMgr::map_write`]. Changes are only visible to other holders once
/// the guard is dropped (or [`UbufMgr::unmap`] is called on it), matching
/// the map/unmap discipline real allocators impose on DMA-backed buffers.
pub struct WriteGuard<'a> {
    bytes: &'a mut BytesMut,
}

impl std::ops::Deref for WriteGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl std::ops::DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Allocates and resizes buffers suited to a particular flow def, the
/// factory half of the buffer/flow-def relationship: a decoder asks its
/// output for a `UbufMgr` matching the negotiated flow def rather than
/// allocating buffers itself, so format changes only require swapping the
/// manager, not touching call sites.
pub trait UbufMgr: Send + Sync {
    /// Allocate a fresh block buffer of `size` bytes, zero-filled.
    fn allocate(&self, size: usize) -> Ubuf;

    /// Resize an existing block buffer in place when possible (single
    /// owner), copying into a freshly allocated buffer otherwise.
    fn resize(&self, ubuf: &mut Ubuf, new_len: usize);

    /// Map a block buffer for reading.
    fn map_read<'a>(&self, ubuf: &'a Ubuf) -> Option<&'a [u8]> {
        ubuf.as_block().map(BlockBuf::as_slice)
    }

    /// Map a block buffer for writing. Returns `None` if the buffer is not
    /// single-owner (callers should `resize`/reallocate first).
    fn map_write<'a>(&self, ubuf: &'a mut Ubuf) -> Option<WriteGuard<'a>>;

    /// Append `other` onto `ubuf` in place.
    fn append(&self, ubuf: Ubuf, other: &Ubuf) -> Ubuf {
        match (ubuf, other) {
            (Ubuf::Block(a), Ubuf::Block(b)) => Ubuf::Block(a.append(b)),
            (ubuf, _) => ubuf,
        }
    }

    /// Enumerate the named planes of a non-block buffer, empty for block
    /// buffers.
    fn iter_planes<'a>(&self, ubuf: &'a Ubuf) -> Vec<(&'static str, &'a Plane)> {
        match ubuf {
            Ubuf::Picture(p) => p.iter_planes().collect(),
            _ => Vec::new(),
        }
    }
}

/// A [`UbufMgr`] allocating plain contiguous block buffers, the manager a
/// container demuxer or codec decoder asks for when its output flow def is
/// `block.*` (coded access units, not planar picture/sound data).
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockUbufMgr;

impl UbufMgr for BlockUbufMgr {
    fn allocate(&self, size: usize) -> Ubuf {
        Ubuf::Block(BlockBuf::from_vec(vec![0u8; size]))
    }

    fn resize(&self, ubuf: &mut Ubuf, new_len: usize) {
        if let Ubuf::Block(block) = ubuf {
            if block.single_owner() && new_len <= block.len() {
                block.resize_view(0, new_len);
            } else {
                let mut data = block.as_slice().to_vec();
                data.resize(new_len, 0);
                *block = BlockBuf::from_vec(data);
            }
        }
    }

    fn map_write<'a>(&self, ubuf: &'a mut Ubuf) -> Option<WriteGuard<'a>> {
        // `BlockBuf` is `Bytes`-backed (immutable once shared); writers that
        // need in-place mutation build a `BytesMut` scratch buffer instead,
        // so this manager conservatively reports no writable mapping.
        let _ = ubuf;
        None
    }
}

/// A [`UbufMgr`] that additionally knows how to register named, subsampled
/// planes, the manager a picture-producing decoder asks for.
pub trait PictureUbufMgr: UbufMgr {
    /// Register a named plane with its chroma subsampling factors on a
    /// picture buffer (allocating the plane's pooled backing storage).
    fn register_plane(&self, pic: &mut PictureBuf, name: &'static str, hsub: u8, vsub: u8);
}

/// A [`PictureUbufMgr`] backed by a shared [`PictureFramePool`].
pub struct PooledPictureUbufMgr {
    pool: PictureFramePool,
}

impl PooledPictureUbufMgr {
    #[must_use]
    pub fn new(pool: PictureFramePool) -> Self {
        Self { pool }
    }
}

impl UbufMgr for PooledPictureUbufMgr {
    fn allocate(&self, size: usize) -> Ubuf {
        Ubuf::Block(BlockBuf::from_vec(vec![0u8; size]))
    }

    fn resize(&self, ubuf: &mut Ubuf, new_len: usize) {
        BlockUbufMgr.resize(ubuf, new_len);
    }

    fn map_write<'a>(&self, ubuf: &'a mut Ubuf) -> Option<WriteGuard<'a>> {
        BlockUbufMgr.map_write(ubuf)
    }
}

impl PictureUbufMgr for PooledPictureUbufMgr {
    fn register_plane(&self, pic: &mut PictureBuf, name: &'static str, hsub: u8, vsub: u8) {
        let plane_w = (pic.hsize >> hsub).max(1) as usize;
        let plane_h = (pic.vsize >> vsub).max(1) as usize;
        let data = Arc::new(self.pool.get(plane_w * plane_h));
        pic.register_plane(name, Plane { data, stride: plane_w, hsub, vsub });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_resize_view_trims_without_copy() {
        let mut block = BlockBuf::from_vec(vec![1, 2, 3, 4, 5, 6]);
        block.resize_view(2, 3);
        assert_eq!(block.as_slice(), &[3, 4, 5]);
    }

    #[test]
    fn block_append_concatenates() {
        let a = BlockBuf::from_vec(vec![1, 2]);
        let b = BlockBuf::from_vec(vec![3, 4]);
        let merged = a.append(&b);
        assert_eq!(merged.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn block_ubuf_mgr_allocates_zeroed() {
        let mgr = BlockUbufMgr;
        let ubuf = mgr.allocate(4);
        assert_eq!(mgr.map_read(&ubuf), Some(&[0u8, 0, 0, 0][..]));
    }

    #[test]
    fn block_ubuf_mgr_resize_grows_in_place_when_single_owner() {
        let mgr = BlockUbufMgr;
        let mut ubuf = Ubuf::Block(BlockBuf::from_vec(vec![1, 2, 3, 4]));
        mgr.resize(&mut ubuf, 2);
        assert_eq!(mgr.map_read(&ubuf), Some(&[1u8, 2][..]));
    }

    #[test]
    fn pooled_picture_ubuf_mgr_registers_subsampled_plane() {
        let pool = PictureFramePool::with_buckets(vec![16, 64], 4);
        let mgr = PooledPictureUbufMgr::new(pool);
        let mut pic = PictureBuf::new(8, 8);
        mgr.register_plane(&mut pic, "u8", 1, 1);
        let plane = pic.plane("u8").expect("plane registered");
        assert_eq!(plane.data.len(), 16); // 4x4 chroma plane at hsub=vsub=1
    }

    #[test]
    fn picture_single_owner_reflects_plane_refcount() {
        let pool = FramePool::<u8>::with_buckets(vec![64], 4);
        let mut pic = PictureBuf::new(8, 8);
        let plane = Arc::new(pool.get(64));
        pic.register_plane("y8", Plane { data: Arc::clone(&plane), stride: 8, hsub: 0, vsub: 0 });
        assert!(pic.single_owner());
        let _clone = Arc::clone(&plane);
        assert!(!pic.single_owner());
    }
}
