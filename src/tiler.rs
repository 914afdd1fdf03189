//! # Block tiler
//!
//! Large images are processed in blocks to cap peak memory, split along
//! both axes so GPU mode can also keep any block under the 4096-pixel
//! texture limit. Blocks overlap so that smoothing near a block edge sees
//! the same neighbourhood it would in a whole-image pass; the overlap is
//! processed but not written back.
//!
//! Tricky part: the source of each block must be the *original* image
//! data, not the output of previously processed neighbours where blocks
//! overlap. Copying the whole image would double peak memory, so instead
//! the overlap strips of every block are archived before a pass and
//! overlaid onto each block as it is fetched. The strips are the only
//! places where one block's results can bleed into another's input.
//!
//! Archive layout, for K blocks with overlap `v`:
//!
//! ```text
//! source                horizontal archive        vertical archive
//! HHHHHHHHHHH           HHHHHH  block 0 top       VvVvVvVv
//! V  0 v  1 V           hhhhhh  block 0 bottom    VvVvVvVv
//! V    v    V           HHHHHH  block 1 top       00112233
//! hhhhhhhhhhh           hhhhhh  block 1 bottom    LRLRLRLR
//! V  2 V  3 V           ...     (K*2*v rows)      (K*2*v columns)
//! HHHHHHHHHHH
//! ```
//!
//! Corners are stored in both archives; redundant, but it keeps the two
//! directions symmetrical.

use aniso_pix::{FloatImage, IntImage, PixError};
use log::debug;

/// Default cap on pixels per block.
pub const MAX_PIXELS_PER_BLOCK: usize = 5_000_000;

/// GPU texture axis limit.
const MAX_GPU_AXIS: usize = 4096;

/// A rectangle in pixels. Block rectangles are absolute in the source
/// image; region rectangles are relative to their block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
}

/// Splits a source image into overlapping blocks and stitches results.
#[derive(Debug, Default)]
pub struct BlockTiler {
    overlap: usize,
    limit_to_gpu_axis: bool,
    /// Outer rectangles: the regions copied from the source, overlap
    /// included. Absolute coordinates.
    blocks: Vec<Rect>,
    /// Inner rectangles: the regions written back, relative to the outer
    /// rectangle of the same index.
    regions: Vec<Rect>,
    horizontal_overlaps: IntImage,
    vertical_overlaps: IntImage,
}

impl BlockTiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain block axes for GPU texture limits.
    pub fn set_gpu_axis_limit(&mut self, limit: bool) {
        self.limit_to_gpu_axis = limit;
    }

    /// Partition `source` into blocks of at most `max_pixels` pixels with
    /// `overlap` pixels of margin on every interior edge.
    pub fn load(&mut self, source: &IntImage, overlap: usize, max_pixels: usize) {
        self.overlap = overlap;
        self.blocks.clear();
        self.regions.clear();

        if source.is_empty() {
            return;
        }

        let mut slice_width = source.width();
        if self.limit_to_gpu_axis {
            slice_width = slice_width.min(MAX_GPU_AXIS - overlap * 2);
        }
        let slice_height = (max_pixels / slice_width).max(1);

        let mut start_row = 0;
        while start_row < source.height() {
            let mut start_col = 0;
            while start_col < source.width() {
                // Process rows [top, bottom) and columns [left, right);
                // the buffers around them are processed but not stored.
                let top = start_row;
                let bottom = (start_row + slice_height).min(source.height());
                let rows = bottom - top;
                let top_buffer = overlap.min(top);
                let bottom_buffer = overlap.min(source.height() - bottom);

                let left = start_col;
                let right = (start_col + slice_width).min(source.width());
                let cols = right - left;
                let left_buffer = overlap.min(left);
                let right_buffer = overlap.min(source.width() - right);

                let block = Rect {
                    left: left - left_buffer,
                    top: top - top_buffer,
                    width: cols + left_buffer + right_buffer,
                    height: rows + top_buffer + bottom_buffer,
                };
                let region = Rect {
                    left: left_buffer,
                    top: top_buffer,
                    width: cols,
                    height: rows,
                };

                debug!("block queued at {}x{}: outer {:?}", start_col, start_row, block);
                self.blocks.push(block);
                self.regions.push(region);

                start_col += slice_width;
            }
            start_row += slice_height;
        }
    }

    /// Drop blocks whose inner rectangle is fully masked out. Must run
    /// before [`Self::save_overlaps`] so the archives match the surviving
    /// blocks.
    pub fn prune_masked(&mut self, mask: &IntImage) {
        if mask.is_empty() {
            return;
        }
        let mut kept_blocks = Vec::with_capacity(self.blocks.len());
        let mut kept_regions = Vec::with_capacity(self.regions.len());
        for (block, region) in self.blocks.iter().zip(&self.regions) {
            let mut active = false;
            'probe: for y in 0..region.height {
                for x in 0..region.width {
                    if mask.at(block.left + region.left + x, block.top + region.top + y) != 0 {
                        active = true;
                        break 'probe;
                    }
                }
            }
            if active {
                kept_blocks.push(*block);
                kept_regions.push(*region);
            } else {
                debug!("block at {},{} fully masked; dropped", block.left, block.top);
            }
        }
        self.blocks = kept_blocks;
        self.regions = kept_regions;
    }

    /// Archive the overlap strips of every block from the current source
    /// pixels. Called at the start of each processing pass, before any
    /// block output lands in the source.
    pub fn save_overlaps(&mut self, source: &IntImage) -> Result<(), PixError> {
        let k = self.blocks.len();
        let v = self.overlap;
        self.horizontal_overlaps = IntImage::alloc(
            self.max_block_width(),
            k * v * 2,
            source.bytes_per_channel(),
            source.channels(),
        )?;
        self.vertical_overlaps = IntImage::alloc(
            k * v * 2,
            self.max_block_height(),
            source.bytes_per_channel(),
            source.channels(),
        )?;

        for (i, (r, br)) in self.blocks.iter().zip(&self.regions).enumerate() {
            // Top and bottom horizontal strips.
            let store_top = i * 2 * v;
            self.horizontal_overlaps
                .copy_from(source, r.left, r.top, 0, store_top, r.width, v)?;
            let store_top = (i * 2 + 1) * v;
            self.horizontal_overlaps.copy_from(
                source,
                r.left,
                r.top + br.top + br.height,
                0,
                store_top,
                r.width,
                v,
            )?;

            // Left and right vertical strips.
            let store_left = i * 2 * v;
            self.vertical_overlaps
                .copy_from(source, r.left, r.top, store_left, 0, v, r.height)?;
            let store_left = (i * 2 + 1) * v;
            self.vertical_overlaps.copy_from(
                source,
                r.left + br.left + br.width,
                r.top,
                store_left,
                0,
                v,
                r.height,
            )?;
        }
        Ok(())
    }

    /// Fetch block `index` into `work`: the outer region from the source,
    /// then the four archived strips overlaid so overlap pixels always
    /// reflect the original data, never a neighbour's output.
    pub fn get_block(
        &self,
        work: &mut FloatImage,
        index: usize,
        channels: usize,
        source: &IntImage,
    ) -> Result<(), PixError> {
        let r = self.blocks[index];
        let br = self.regions[index];
        let v = self.overlap;
        work.alloc(r.width, r.height, channels)?;

        work.copy_from_int(source, r.left, r.top, 0, 0, r.width, r.height);

        let store_top = index * 2 * v;
        work.copy_from_int(&self.horizontal_overlaps, 0, store_top, 0, 0, r.width, v);
        let store_top = (index * 2 + 1) * v;
        work.copy_from_int(
            &self.horizontal_overlaps,
            0,
            store_top,
            0,
            br.top + br.height,
            r.width,
            v,
        );

        let store_left = index * 2 * v;
        work.copy_from_int(&self.vertical_overlaps, store_left, 0, 0, 0, v, r.height);
        let store_left = (index * 2 + 1) * v;
        work.copy_from_int(
            &self.vertical_overlaps,
            store_left,
            0,
            br.left + br.width,
            0,
            v,
            r.height,
        );
        Ok(())
    }

    /// The outer rectangle of block `index`, for clipping the mask.
    pub fn block_rect(&self, index: usize) -> Rect {
        self.blocks[index]
    }

    /// The inner rectangle of block `index`, relative to its outer one.
    pub fn region_rect(&self, index: usize) -> Rect {
        self.regions[index]
    }

    /// Write the inner rectangle of a processed block back to the source.
    pub fn store_block(&self, work: &FloatImage, index: usize, source: &mut IntImage) {
        let r = self.blocks[index];
        let br = self.regions[index];
        work.copy_to_int(
            source,
            br.left,
            br.top,
            r.left + br.left,
            r.top + br.top,
            br.width,
            br.height,
        );
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total outer rows across blocks; the progress denominator.
    pub fn total_rows(&self) -> usize {
        self.blocks.iter().map(|b| b.height).sum()
    }

    pub fn total_cols(&self) -> usize {
        self.blocks.iter().map(|b| b.width).sum()
    }

    pub fn max_block_width(&self) -> usize {
        self.blocks.iter().map(|b| b.width).max().unwrap_or(0)
    }

    pub fn max_block_height(&self) -> usize {
        self.blocks.iter().map(|b| b.height).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_image(w: usize, h: usize) -> IntImage {
        let mut img = IntImage::alloc(w, h, 1, 1).unwrap();
        img.fill(7);
        img
    }

    /// Inner rectangles must tile the image exactly once, whatever the
    /// geometry.
    #[test]
    fn inner_rectangles_cover_image_exactly_once() {
        for (w, h, overlap, max_pixels) in [
            (100, 100, 8, 100_000),
            (3000, 100, 16, 100_000),
            (37, 53, 5, 200),
            (1, 1, 4, 100),
            (256, 256, 0, 1000),
        ] {
            let src = flat_image(w, h);
            let mut tiler = BlockTiler::new();
            tiler.load(&src, overlap, max_pixels);

            let mut hits = vec![0u8; w * h];
            for i in 0..tiler.total_blocks() {
                let r = tiler.block_rect(i);
                let br = tiler.region_rect(i);
                assert!(br.left + br.width <= r.width);
                assert!(br.top + br.height <= r.height);
                assert!(r.left + r.width <= w && r.top + r.height <= h);
                for y in 0..br.height {
                    for x in 0..br.width {
                        hits[(r.top + br.top + y) * w + (r.left + br.left + x)] += 1;
                    }
                }
            }
            assert!(
                hits.iter().all(|&c| c == 1),
                "coverage broken for {}x{} overlap {} max {}",
                w,
                h,
                overlap,
                max_pixels
            );
        }
    }

    #[test]
    fn gpu_axis_limit_constrains_block_width() {
        let src = flat_image(9000, 2);
        let mut tiler = BlockTiler::new();
        tiler.set_gpu_axis_limit(true);
        tiler.load(&src, 50, usize::MAX / 4);
        for i in 0..tiler.total_blocks() {
            assert!(tiler.block_rect(i).width <= 4096);
        }
    }

    #[test]
    fn fully_masked_blocks_are_dropped() {
        let src = flat_image(100, 100);
        let mut mask = IntImage::alloc(100, 100, 1, 1).unwrap();
        // Activate only the bottom half.
        for y in 50..100 {
            for x in 0..100 {
                let i = y * mask.stride_bytes() + x;
                mask.bytes_mut()[i] = 255;
            }
        }
        let mut tiler = BlockTiler::new();
        // Ten full-width blocks of ten rows each.
        tiler.load(&src, 2, 1000);
        let before = tiler.total_blocks();
        tiler.prune_masked(&mask);
        assert!(tiler.total_blocks() < before);
        for i in 0..tiler.total_blocks() {
            let r = tiler.block_rect(i);
            let br = tiler.region_rect(i);
            assert!(r.top + br.top >= 50, "top-half block survived the prune");
        }
    }

    #[test]
    fn all_zero_mask_drops_every_block() {
        let src = flat_image(64, 64);
        let mask = IntImage::alloc(64, 64, 1, 1).unwrap();
        let mut tiler = BlockTiler::new();
        tiler.load(&src, 4, 1000);
        tiler.prune_masked(&mask);
        assert_eq!(tiler.total_blocks(), 0);
    }

    /// Overlap pixels fetched for a block must be the archived originals,
    /// not whatever a neighbouring block wrote meanwhile.
    #[test]
    fn get_block_restores_archived_overlap() {
        let mut src = IntImage::alloc(16, 24, 1, 1).unwrap();
        for i in 0..src.bytes().len() {
            src.bytes_mut()[i] = (i % 251) as u8;
        }
        let original = src.clone();

        let mut tiler = BlockTiler::new();
        tiler.load(&src, 3, 128); // full-width blocks of 8 rows
        assert!(tiler.total_blocks() >= 2);
        tiler.save_overlaps(&src).unwrap();

        // Clobber the source as if block 0 had been processed and stored.
        src.fill(0);

        let mut work = FloatImage::new();
        tiler.get_block(&mut work, 1, 4, &src).unwrap();
        let r = tiler.block_rect(1);
        let br = tiler.region_rect(1);
        assert!(br.top > 0);
        // The top overlap strip of block 1 must come from the archive.
        for y in 0..br.top {
            for x in 0..r.width {
                let expect = original.at(r.left + x, r.top + y) as f32;
                assert_eq!(work.at(x, y, 0), expect, "overlap not restored at {},{}", x, y);
            }
        }
    }

    #[test]
    fn store_block_writes_only_the_inner_region() {
        let src = flat_image(30, 30);
        let mut dst = src.clone();
        let mut tiler = BlockTiler::new();
        tiler.load(&src, 3, 300); // 30x10 blocks
        assert!(tiler.total_blocks() >= 2);

        let mut work = FloatImage::new();
        tiler.save_overlaps(&src).unwrap();
        tiler.get_block(&mut work, 1, 4, &src).unwrap();
        work.fill(200.0);
        tiler.store_block(&work, 1, &mut dst);

        let r = tiler.block_rect(1);
        let br = tiler.region_rect(1);
        let mut changed = 0;
        for y in 0..30 {
            for x in 0..30 {
                let inside = x >= r.left + br.left
                    && x < r.left + br.left + br.width
                    && y >= r.top + br.top
                    && y < r.top + br.top + br.height;
                if inside {
                    assert_eq!(dst.at(x, y), 200);
                    changed += 1;
                } else {
                    assert_eq!(dst.at(x, y), 7);
                }
            }
        }
        assert_eq!(changed, br.width * br.height);
    }
}
