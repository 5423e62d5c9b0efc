use crate::cards::{Cards, CardsError};

/// Observation parameters carried in every block header. The capture stage
/// writes them from its configuration; the fold stage re-reads the full
/// set at start of observation and on every integration.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsParams {
    pub src_name: String,
    pub obs_mode: String,
    /// Integer MJD of observation start.
    pub stt_imjd: i64,
    /// Seconds into the start day.
    pub stt_smjd: f64,
    /// Per-sample time in seconds.
    pub tbin: f64,
    pub obsnchan: i64,
    pub npol: i64,
    pub nbin: i64,
    /// Sampler accumulation length, needed by the Parkes rescale.
    pub acc_len: i64,
}

impl ObsParams {
    pub fn read(cards: &Cards<'_>) -> Result<Self, CardsError> {
        Ok(Self {
            src_name: cards.get_str("SRC_NAME")?,
            obs_mode: cards.get_str("OBS_MODE")?,
            stt_imjd: cards.get_int("STT_IMJD")?,
            stt_smjd: cards.get_dbl("STT_SMJD")?,
            tbin: cards.get_dbl("TBIN")?,
            obsnchan: cards.get_int("OBSNCHAN")?,
            npol: cards.get_int("NPOL")?,
            nbin: cards.get_int("NBIN")?,
            acc_len: cards.get_int("ACC_LEN").unwrap_or(1),
        })
    }

    pub fn write(&self, cards: &mut Cards<'_>) -> Result<(), CardsError> {
        cards.put_str("SRC_NAME", &self.src_name)?;
        cards.put_str("OBS_MODE", &self.obs_mode)?;
        cards.put_int("STT_IMJD", self.stt_imjd)?;
        cards.put_dbl("STT_SMJD", self.stt_smjd)?;
        cards.put_dbl("TBIN", self.tbin)?;
        cards.put_int("OBSNCHAN", self.obsnchan)?;
        cards.put_int("NPOL", self.npol)?;
        cards.put_int("NBIN", self.nbin)?;
        cards.put_int("ACC_LEN", self.acc_len)?;
        Ok(())
    }
}

/// Per-block bookkeeping the capture stage seals into a header just before
/// `set_filled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubintParams {
    /// Sequence number of the first packet slot in the block.
    pub pktidx: i64,
    /// Payload bytes per packet slot.
    pub pktsize: i64,
    /// Packet slots accounted in the block, zero-filled ones included.
    pub npkt: i64,
    /// Zero-filled slots.
    pub ndrop: i64,
}

impl SubintParams {
    pub fn read(cards: &Cards<'_>) -> Result<Self, CardsError> {
        Ok(Self {
            pktidx: cards.get_int("PKTIDX")?,
            pktsize: cards.get_int("PKTSIZE")?,
            npkt: cards.get_int("NPKT")?,
            ndrop: cards.get_int("NDROP")?,
        })
    }

    pub fn write(&self, cards: &mut Cards<'_>) -> Result<(), CardsError> {
        cards.put_int("PKTIDX", self.pktidx)?;
        cards.put_int("PKTSIZE", self.pktsize)?;
        cards.put_int("NPKT", self.npkt)?;
        cards.put_int("NDROP", self.ndrop)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::CARD_LEN;

    #[test]
    fn obs_params_roundtrip() {
        let mut buf = vec![0u8; 32 * CARD_LEN];
        let mut c = Cards::new(&mut buf);
        c.clear();
        let p = ObsParams {
            src_name: "J0437-4715".into(),
            obs_mode: "SEARCH".into(),
            stt_imjd: 60950,
            stt_smjd: 43200.5,
            tbin: 40.96e-6,
            obsnchan: 512,
            npol: 2,
            nbin: 256,
            acc_len: 16,
        };
        p.write(&mut c).unwrap();
        assert_eq!(ObsParams::read(&c).unwrap(), p);
    }

    #[test]
    fn subint_params_roundtrip() {
        let mut buf = vec![0u8; 16 * CARD_LEN];
        let mut c = Cards::new(&mut buf);
        c.clear();
        let s = SubintParams {
            pktidx: 1 << 40,
            pktsize: 8192,
            npkt: 4096,
            ndrop: 17,
        };
        s.write(&mut c).unwrap();
        assert_eq!(SubintParams::read(&c).unwrap(), s);
    }

    #[test]
    fn missing_acc_len_defaults_to_one() {
        let mut buf = vec![0u8; 32 * CARD_LEN];
        let mut c = Cards::new(&mut buf);
        c.clear();
        let mut p = ObsParams {
            src_name: "B1937+21".into(),
            obs_mode: "SEARCH".into(),
            stt_imjd: 60000,
            stt_smjd: 0.0,
            tbin: 10.24e-6,
            obsnchan: 1024,
            npol: 4,
            nbin: 128,
            acc_len: 1,
        };
        p.write(&mut c).unwrap();
        // Simulate an older header without the key by rebuilding sans ACC_LEN.
        let mut buf2 = vec![0u8; 32 * CARD_LEN];
        let mut c2 = Cards::new(&mut buf2);
        c2.clear();
        for key in ["SRC_NAME", "OBS_MODE"] {
            c2.put_str(key, &c.get_str(key).unwrap()).unwrap();
        }
        for key in ["STT_IMJD", "OBSNCHAN", "NPOL", "NBIN"] {
            c2.put_int(key, c.get_int(key).unwrap()).unwrap();
        }
        for key in ["STT_SMJD", "TBIN"] {
            c2.put_dbl(key, c.get_dbl(key).unwrap()).unwrap();
        }
        p.acc_len = 1;
        assert_eq!(ObsParams::read(&c2).unwrap(), p);
    }
}
