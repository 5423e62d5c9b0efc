//! Fold histograms.
//!
//! A fold histogram has one float accumulator and one hit counter per
//! (phase bin, channel, polarization) cell, phase bin slowest. Workers own
//! a heap-allocated [`FoldBuf`] each; the merge target is a [`FoldView`]
//! aliasing the current output block, laid out as the full float array
//! followed by the full count array.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldShape {
    pub nbin: usize,
    pub nchan: usize,
    pub npol: usize,
}

impl FoldShape {
    pub fn cells(&self) -> usize {
        self.nbin * self.nchan * self.npol
    }

    /// Bytes a fold of this shape occupies in an output block.
    pub fn block_bytes(&self) -> usize {
        self.cells() * (size_of::<f32>() + size_of::<u32>())
    }

    #[inline]
    pub fn cell(&self, ibin: usize, ichan: usize, ipol: usize) -> usize {
        (ibin * self.nchan + ichan) * self.npol + ipol
    }
}

/// Worker-local histogram.
#[derive(Debug, Clone)]
pub struct FoldBuf {
    shape: FoldShape,
    data: Vec<f32>,
    count: Vec<u32>,
}

impl FoldBuf {
    pub fn new(shape: FoldShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.cells()],
            count: vec![0; shape.cells()],
        }
    }

    pub fn shape(&self) -> FoldShape {
        self.shape
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.count.fill(0);
    }

    #[inline]
    pub fn add_sample(&mut self, ibin: usize, ichan: usize, ipol: usize, value: f32) {
        let i = self.shape.cell(ibin, ichan, ipol);
        self.data[i] += value;
        self.count[i] += 1;
    }

    /// Elementwise merge of another histogram of the same shape.
    pub fn accumulate(&mut self, other: &FoldBuf) {
        assert_eq!(self.shape, other.shape, "fold shape mismatch");
        for (d, o) in self.data.iter_mut().zip(&other.data) {
            *d += o;
        }
        for (c, o) in self.count.iter_mut().zip(&other.count) {
            *c += o;
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn count(&self) -> &[u32] {
        &self.count
    }
}

/// Histogram aliasing an output block's data region: floats first, counts
/// directly after. The coordinator rebinds one of these to each new output
/// block and merges joined workers into it.
pub struct FoldView {
    shape: FoldShape,
    data: *mut f32,
    count: *mut u32,
}

// SAFETY: only the fold coordinator holds a FoldView, and only while it
// owns the underlying output block as producer.
unsafe impl Send for FoldView {}

impl FoldView {
    /// Bind to a block data region.
    ///
    /// # Safety
    /// `block` must stay owned by the caller for the lifetime of the view,
    /// and must be at least `shape.block_bytes()` long (the databuf's data
    /// regions are page aligned, which covers the f32/u32 alignment).
    pub unsafe fn bind(block: *mut u8, shape: FoldShape) -> Self {
        let data = block as *mut f32;
        // Counts start right after the float array.
        let count = unsafe { block.add(shape.cells() * size_of::<f32>()) } as *mut u32;
        Self { shape, data, count }
    }

    pub fn shape(&self) -> FoldShape {
        self.shape
    }

    pub fn clear(&mut self) {
        let (data, count) = self.as_mut_slices();
        data.fill(0.0);
        count.fill(0);
    }

    pub fn accumulate(&mut self, other: &FoldBuf) {
        assert_eq!(self.shape, other.shape(), "fold shape mismatch");
        let (data, count) = self.as_mut_slices();
        for (d, o) in data.iter_mut().zip(other.data()) {
            *d += o;
        }
        for (c, o) in count.iter_mut().zip(other.count()) {
            *c += o;
        }
    }

    pub fn as_slices(&self) -> (&[f32], &[u32]) {
        let n = self.shape.cells();
        // Bound by the bind() contract.
        unsafe {
            (
                std::slice::from_raw_parts(self.data, n),
                std::slice::from_raw_parts(self.count, n),
            )
        }
    }

    fn as_mut_slices(&mut self) -> (&mut [f32], &mut [u32]) {
        let n = self.shape.cells();
        unsafe {
            (
                std::slice::from_raw_parts_mut(self.data, n),
                std::slice::from_raw_parts_mut(self.count, n),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> FoldShape {
        FoldShape {
            nbin: 4,
            nchan: 3,
            npol: 2,
        }
    }

    #[test]
    fn cell_indexing_is_bin_major_pol_fastest() {
        let s = shape();
        assert_eq!(s.cell(0, 0, 0), 0);
        assert_eq!(s.cell(0, 0, 1), 1);
        assert_eq!(s.cell(0, 1, 0), 2);
        assert_eq!(s.cell(1, 0, 0), 6);
        assert_eq!(s.cells(), 24);
        assert_eq!(s.block_bytes(), 24 * 8);
    }

    #[test]
    fn accumulate_sums_data_and_counts() {
        let mut a = FoldBuf::new(shape());
        let mut b = FoldBuf::new(shape());
        a.add_sample(1, 2, 0, 3.0);
        b.add_sample(1, 2, 0, 4.0);
        b.add_sample(0, 0, 1, 1.0);
        a.accumulate(&b);
        let i = shape().cell(1, 2, 0);
        assert_eq!(a.data()[i], 7.0);
        assert_eq!(a.count()[i], 2);
        let j = shape().cell(0, 0, 1);
        assert_eq!(a.data()[j], 1.0);
        assert_eq!(a.count()[j], 1);
    }

    #[test]
    fn view_aliases_raw_block_bytes() {
        let s = shape();
        let mut block = vec![0u8; s.block_bytes()];
        let mut view = unsafe { FoldView::bind(block.as_mut_ptr(), s) };
        view.clear();
        let mut fb = FoldBuf::new(s);
        fb.add_sample(2, 1, 1, 5.0);
        view.accumulate(&fb);
        view.accumulate(&fb);
        let (data, count) = view.as_slices();
        let i = s.cell(2, 1, 1);
        assert_eq!(data[i], 10.0);
        assert_eq!(count[i], 2);
        // The first float in the block is cell 0, still empty.
        assert_eq!(f32::from_ne_bytes(block[..4].try_into().unwrap()), 0.0);
    }
}
