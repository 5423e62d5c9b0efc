//! The fold kernel: accumulate 8-bit detected power into a phase
//! histogram.
//!
//! Input blocks are time-major: for each time sample, `nchan · npol`
//! consecutive bytes. The kernel evaluates the pulsar phase at each
//! sample's epoch, maps its fractional part to a bin, and adds every
//! channel/polarization value of the sample into that bin's cells.

use vela_polyco::Polyco;

use crate::foldbuf::FoldBuf;

pub struct FoldArgs<'a> {
    pub data: &'a [u8],
    pub pc: &'a Polyco,
    pub imjd: i64,
    /// Fractional MJD of the first sample in `data`.
    pub fmjd: f64,
    pub nsamp: usize,
    /// Seconds per sample.
    pub tsamp: f64,
    /// 8-bit samples are two's complement when set, offset binary
    /// otherwise.
    pub raw_signed: bool,
}

pub fn fold_8bit_power(args: &FoldArgs<'_>, fb: &mut FoldBuf) {
    let shape = fb.shape();
    let stride = shape.nchan * shape.npol;
    let nsamp = args.nsamp.min(args.data.len() / stride);
    let nbin = shape.nbin as f64;

    for isamp in 0..nsamp {
        let fmjd = args.fmjd + isamp as f64 * args.tsamp / 86400.0;
        let phase = args.pc.phase(args.imjd, fmjd);
        let frac = phase.rem_euclid(1.0);
        let ibin = ((frac * nbin) as usize).min(shape.nbin - 1);

        let row = &args.data[isamp * stride..(isamp + 1) * stride];
        for ichan in 0..shape.nchan {
            for ipol in 0..shape.npol {
                let raw = row[ichan * shape.npol + ipol];
                let value = if args.raw_signed {
                    raw as i8 as f32
                } else {
                    raw as f32
                };
                fb.add_sample(ibin, ichan, ipol, value);
            }
        }
    }
}
