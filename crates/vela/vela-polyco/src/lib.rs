//! `vela-polyco`: pulsar rotational phase models.
//!
//! A polyco file is a sequence of records, each a Chebyshev-free polynomial
//! fit of pulse phase against time, valid over a span of minutes around a
//! reference epoch. The fold stage loads the whole file on a cache miss and
//! picks the record covering each block's midpoint.
//!
//! Record format (one per fit, records are self-delimiting):
//!
//! ```text
//! NAME      DATE     UTC        TMID            DM     DOPPLER  RMS
//! RPHASE            F0(Hz)        SITE SPAN NCOEFF OBSFREQ  BINPHASE
//! COEFF1  COEFF2  COEFF3          (three per line, Fortran D exponents)
//! ...
//! ```
//!
//! Phase at (imjd, fmjd) is evaluated as
//! `rphase + 60·dt·f0 + Σ coeff[i]·dtⁱ` with `dt` in minutes from TMID.

use std::io::{self, BufRead};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolycoError {
    #[error("failed reading polyco source")]
    Io(#[from] io::Error),
    #[error("polyco record {record}: {what}")]
    Malformed { record: usize, what: String },
    #[error("polyco source contains no records")]
    Empty,
}

/// One polynomial phase model.
#[derive(Debug, Clone, PartialEq)]
pub struct Polyco {
    pub name: String,
    /// Reference epoch, split for precision.
    pub imjd: i64,
    pub fmjd: f64,
    /// Reference phase at the epoch.
    pub rphase: f64,
    /// Rotation frequency at the epoch, Hz.
    pub f0: f64,
    /// Observatory site code.
    pub site: String,
    /// Validity span in minutes, centred on the epoch.
    pub span_min: f64,
    pub obs_freq: f64,
    pub coeffs: Vec<f64>,
}

impl Polyco {
    /// Minutes from the reference epoch to (imjd, fmjd).
    fn dt_min(&self, imjd: i64, fmjd: f64) -> f64 {
        ((imjd - self.imjd) as f64 + (fmjd - self.fmjd)) * 1440.0
    }

    /// True if the epoch falls inside this record's validity interval.
    pub fn covers(&self, imjd: i64, fmjd: f64) -> bool {
        self.dt_min(imjd, fmjd).abs() <= self.span_min / 2.0
    }

    /// Absolute rotational phase (turns) at the epoch.
    pub fn phase(&self, imjd: i64, fmjd: f64) -> f64 {
        let dt = self.dt_min(imjd, fmjd);
        let mut poly = 0.0;
        for &c in self.coeffs.iter().rev() {
            poly = poly * dt + c;
        }
        self.rphase + dt * 60.0 * self.f0 + poly
    }

    /// Apparent rotation frequency (Hz) at the epoch.
    pub fn rotation_freq(&self, imjd: i64, fmjd: f64) -> f64 {
        let dt = self.dt_min(imjd, fmjd);
        let mut deriv = 0.0;
        for (i, &c) in self.coeffs.iter().enumerate().skip(1).rev() {
            deriv = deriv * dt + c * i as f64;
        }
        self.f0 + deriv / 60.0
    }

    /// Read every record from a polyco source. Reading stops at end of
    /// input or at the first malformed trailing record; at least one full
    /// record must be present.
    pub fn read_all<R: BufRead>(reader: R) -> Result<Vec<Polyco>, PolycoError> {
        let mut lines = reader.lines();
        let mut out = Vec::new();
        loop {
            match read_one(&mut lines, out.len()) {
                Ok(Some(pc)) => out.push(pc),
                Ok(None) => break,
                Err(e) if out.is_empty() => return Err(e),
                // Trailing junk after good records terminates the set.
                Err(_) => break,
            }
        }
        if out.is_empty() {
            return Err(PolycoError::Empty);
        }
        Ok(out)
    }
}

/// Index of the record whose validity interval covers (imjd, fmjd) and,
/// when `source` is given, whose pulsar name matches it.
pub fn select_pc(pcs: &[Polyco], source: Option<&str>, imjd: i64, fmjd: f64) -> Option<usize> {
    pcs.iter().position(|pc| {
        source.is_none_or(|s| names_match(&pc.name, s)) && pc.covers(imjd, fmjd)
    })
}

/// Polyco names drop the leading B/J epoch letter in some tempo setups,
/// so compare with and without it.
fn names_match(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches(['B', 'J']).to_string();
    a.trim() == b.trim() || strip(a) == strip(b)
}

fn read_one<I>(lines: &mut I, record: usize) -> Result<Option<Polyco>, PolycoError>
where
    I: Iterator<Item = io::Result<String>>,
{
    let malformed = |what: &str| PolycoError::Malformed {
        record,
        what: what.to_string(),
    };

    // First non-blank line opens a record; clean EOF before one is fine.
    let first = loop {
        match lines.next() {
            None => return Ok(None),
            Some(l) => {
                let l = l?;
                if !l.trim().is_empty() {
                    break l;
                }
            }
        }
    };

    let f1: Vec<&str> = first.split_whitespace().collect();
    if f1.len() < 4 {
        return Err(malformed("header line 1 too short"));
    }
    let name = f1[0].to_string();
    let tmid: f64 = parse_num(f1[3]).ok_or_else(|| malformed("bad TMID"))?;
    let imjd = tmid.floor() as i64;
    let fmjd = tmid - imjd as f64;

    let second = lines
        .next()
        .transpose()?
        .ok_or_else(|| malformed("missing header line 2"))?;
    let f2: Vec<&str> = second.split_whitespace().collect();
    if f2.len() < 6 {
        return Err(malformed("header line 2 too short"));
    }
    let rphase: f64 = parse_num(f2[0]).ok_or_else(|| malformed("bad RPHASE"))?;
    let f0: f64 = parse_num(f2[1]).ok_or_else(|| malformed("bad F0"))?;
    let site = f2[2].to_string();
    let span_min: f64 = parse_num(f2[3]).ok_or_else(|| malformed("bad SPAN"))?;
    let ncoeff: usize = f2[4].parse().map_err(|_| malformed("bad NCOEFF"))?;
    let obs_freq: f64 = parse_num(f2[5]).ok_or_else(|| malformed("bad OBSFREQ"))?;
    if ncoeff == 0 || ncoeff > 30 {
        return Err(malformed("NCOEFF out of range"));
    }

    let mut coeffs = Vec::with_capacity(ncoeff);
    while coeffs.len() < ncoeff {
        let line = lines
            .next()
            .transpose()?
            .ok_or_else(|| malformed("truncated coefficient block"))?;
        for tok in line.split_whitespace() {
            if coeffs.len() == ncoeff {
                return Err(malformed("excess coefficients on line"));
            }
            coeffs.push(parse_num(tok).ok_or_else(|| malformed("bad coefficient"))?);
        }
    }

    Ok(Some(Polyco {
        name,
        imjd,
        fmjd,
        rphase,
        f0,
        site,
        span_min,
        obs_freq,
        coeffs,
    }))
}

/// Fortran prints exponents as D; rustc's f64 parser wants E.
fn parse_num(tok: &str) -> Option<f64> {
    tok.replace(['D', 'd'], "E").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "\
B0833-45    8-Jan-26  120000.00   61048.50000000           67.99   0.000  -6.214
  1234567890.123456     11.194601234567  7  120   12  1400.000
  1.23456789012345D-06 -2.34567890123456D-08  3.45678901234567D-10
 -4.56789012345678D-12  5.67890123456789D-14 -6.78901234567890D-16
  7.89012345678901D-18 -8.90123456789012D-20  9.01234567890123D-22
 -1.01234567890123D-23  1.11234567890123D-25 -1.21234567890123D-27
B0833-45    8-Jan-26  140000.00   61048.58333333           67.99   0.000  -6.214
  1234575972.000000     11.194601000000  7  120    3  1400.000
  1.00000000000000D-06 -2.00000000000000D-08  3.00000000000000D-10
";

    #[test]
    fn parses_all_records() {
        let pcs = Polyco::read_all(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(pcs.len(), 2);
        assert_eq!(pcs[0].name, "B0833-45");
        assert_eq!(pcs[0].imjd, 61048);
        assert!((pcs[0].fmjd - 0.5).abs() < 1e-9);
        assert_eq!(pcs[0].coeffs.len(), 12);
        assert_eq!(pcs[1].coeffs.len(), 3);
        assert!((pcs[0].coeffs[1] + 2.34567890123456e-8).abs() < 1e-20);
    }

    #[test]
    fn selection_honours_span_and_name() {
        let pcs = Polyco::read_all(Cursor::new(SAMPLE)).unwrap();
        // 10 minutes past the first record's epoch: inside its 120-min span.
        let fmjd = 0.5 + 10.0 / 1440.0;
        assert_eq!(select_pc(&pcs, Some("B0833-45"), 61048, fmjd), Some(0));
        // Also matches without the epoch letter.
        assert_eq!(select_pc(&pcs, Some("0833-45"), 61048, fmjd), Some(0));
        // A different pulsar never matches.
        assert_eq!(select_pc(&pcs, Some("J0437-4715"), 61048, fmjd), None);
        // Far outside every span.
        assert_eq!(select_pc(&pcs, None, 61050, 0.0), None);
        // Second record's window.
        let fmjd2 = 0.58333333;
        assert_eq!(select_pc(&pcs, None, 61048, fmjd2), Some(1));
    }

    #[test]
    fn phase_advances_at_f0_near_epoch() {
        let pcs = Polyco::read_all(Cursor::new(SAMPLE)).unwrap();
        let pc = &pcs[1];
        let p0 = pc.phase(pc.imjd, pc.fmjd);
        let one_sec = 1.0 / 86400.0;
        let p1 = pc.phase(pc.imjd, pc.fmjd + one_sec);
        // Low-order coefficients barely perturb a 1-second baseline.
        assert!((p1 - p0 - pc.f0).abs() < 1e-4, "got {}", p1 - p0);
        let f = pc.rotation_freq(pc.imjd, pc.fmjd);
        assert!((f - pc.f0).abs() < 1e-6);
    }

    #[test]
    fn trailing_garbage_keeps_good_records() {
        let text = format!("{SAMPLE}\nnot a polyco record at all\n");
        let pcs = Polyco::read_all(Cursor::new(text)).unwrap();
        assert_eq!(pcs.len(), 2);
    }

    #[test]
    fn empty_source_is_an_error() {
        assert!(matches!(
            Polyco::read_all(Cursor::new("")),
            Err(PolycoError::Empty)
        ));
        assert!(Polyco::read_all(Cursor::new("one\n")).is_err());
    }
}
