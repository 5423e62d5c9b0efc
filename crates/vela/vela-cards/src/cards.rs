use thiserror::Error;

/// Length of one record.
pub const CARD_LEN: usize = 80;

/// Width of the key field. Keys are right-padded with blanks to this width.
const KEY_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CardsError {
    #[error("card buffer full while writing key '{0}'")]
    Full(String),
    #[error("key '{0}' not found")]
    Missing(String),
    #[error("value of key '{key}' does not parse as {wanted}")]
    Parse { key: String, wanted: &'static str },
    #[error("key '{0}' is longer than 8 characters")]
    KeyTooLong(String),
}

/// A keyword/value dictionary over a borrowed byte buffer.
///
/// The buffer is typically a block header or the status text area inside a
/// shared region. `Cards` never allocates inside the buffer and never moves
/// existing records; an update overwrites the record in place, an insert
/// goes where `END` was and `END` is pushed one record down.
pub struct Cards<'a> {
    buf: &'a mut [u8],
}

impl<'a> Cards<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Empty the dictionary: blank the buffer and write `END` at record 0.
    pub fn clear(&mut self) {
        self.buf.fill(b' ');
        self.write_record(0, "END", None);
    }

    /// True if the buffer holds a terminated dictionary. A freshly zeroed
    /// region does not, and must be `clear()`ed before use.
    pub fn is_initialized(&self) -> bool {
        self.end_record().is_some()
    }

    /// Verbatim copy of another header into this one, used when the fold
    /// stage seeds an output block header from its input. The source's END
    /// is carried along with everything before it.
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = self.buf.len().min(src.len());
        self.buf[..n].copy_from_slice(&src[..n]);
    }

    pub fn raw(&self) -> &[u8] {
        self.buf
    }

    pub fn put_str(&mut self, key: &str, value: &str) -> Result<(), CardsError> {
        self.put(key, &format!("'{value}'"))
    }

    pub fn put_int(&mut self, key: &str, value: i64) -> Result<(), CardsError> {
        self.put(key, &format!("{value:>20}"))
    }

    pub fn put_dbl(&mut self, key: &str, value: f64) -> Result<(), CardsError> {
        // 17 significant digits, so doubles survive a write/read round trip.
        self.put(key, &format!("{value:>20.16E}"))
    }

    pub fn get_str(&self, key: &str) -> Result<String, CardsError> {
        let v = self.get_value(key)?;
        let v = v.trim();
        let inner = v
            .strip_prefix('\'')
            .and_then(|s| s.rfind('\'').map(|i| &s[..i]))
            .unwrap_or(v);
        Ok(inner.trim_end().to_string())
    }

    pub fn get_int(&self, key: &str) -> Result<i64, CardsError> {
        let v = self.get_value(key)?;
        v.trim().parse().map_err(|_| CardsError::Parse {
            key: key.to_string(),
            wanted: "integer",
        })
    }

    pub fn get_dbl(&self, key: &str) -> Result<f64, CardsError> {
        let v = self.get_value(key)?;
        v.trim().parse().map_err(|_| CardsError::Parse {
            key: key.to_string(),
            wanted: "double",
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), CardsError> {
        if key.len() > KEY_LEN {
            return Err(CardsError::KeyTooLong(key.to_string()));
        }
        if let Some(rec) = self.find(key) {
            self.write_record(rec, key, Some(value));
            return Ok(());
        }
        let end = self
            .end_record()
            .ok_or_else(|| CardsError::Full(key.to_string()))?;
        // Need room for the new record plus the pushed-down END.
        if (end + 2) * CARD_LEN > self.buf.len() {
            return Err(CardsError::Full(key.to_string()));
        }
        self.write_record(end, key, Some(value));
        self.write_record(end + 1, "END", None);
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<&str, CardsError> {
        let rec = self
            .find(key)
            .ok_or_else(|| CardsError::Missing(key.to_string()))?;
        let card = &self.buf[rec * CARD_LEN..(rec + 1) * CARD_LEN];
        // Value starts after "KEY     = ".
        let value = &card[KEY_LEN + 2..];
        std::str::from_utf8(value).map_err(|_| CardsError::Parse {
            key: key.to_string(),
            wanted: "utf-8 text",
        })
    }

    fn find(&self, key: &str) -> Option<usize> {
        if key.len() > KEY_LEN {
            return None;
        }
        let padded = Self::pad_key(key);
        for rec in 0..self.n_records() {
            let card = &self.buf[rec * CARD_LEN..(rec + 1) * CARD_LEN];
            if card[..KEY_LEN] == padded {
                return Some(rec);
            }
            if card[..3] == *b"END" && card[3..KEY_LEN].iter().all(|&c| c == b' ') {
                return None;
            }
        }
        None
    }

    fn end_record(&self) -> Option<usize> {
        for rec in 0..self.n_records() {
            let card = &self.buf[rec * CARD_LEN..(rec + 1) * CARD_LEN];
            if card[..3] == *b"END" && card[3..KEY_LEN].iter().all(|&c| c == b' ') {
                return Some(rec);
            }
        }
        None
    }

    fn n_records(&self) -> usize {
        self.buf.len() / CARD_LEN
    }

    fn pad_key(key: &str) -> [u8; KEY_LEN] {
        let mut out = [b' '; KEY_LEN];
        out[..key.len()].copy_from_slice(key.as_bytes());
        out
    }

    fn write_record(&mut self, rec: usize, key: &str, value: Option<&str>) {
        let card = &mut self.buf[rec * CARD_LEN..(rec + 1) * CARD_LEN];
        card.fill(b' ');
        card[..key.len()].copy_from_slice(key.as_bytes());
        if let Some(v) = value {
            card[KEY_LEN] = b'=';
            let vstart = KEY_LEN + 2;
            let n = v.len().min(CARD_LEN - vstart);
            card[vstart..vstart + n].copy_from_slice(&v.as_bytes()[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> Vec<u8> {
        vec![0u8; 16 * CARD_LEN]
    }

    #[test]
    fn put_get_roundtrip() {
        let mut b = buf();
        let mut c = Cards::new(&mut b);
        c.clear();
        c.put_str("SRC_NAME", "B0833-45").unwrap();
        c.put_int("NPKT", 4096).unwrap();
        c.put_dbl("DROPAVG", 0.015625).unwrap();
        assert_eq!(c.get_str("SRC_NAME").unwrap(), "B0833-45");
        assert_eq!(c.get_int("NPKT").unwrap(), 4096);
        assert!((c.get_dbl("DROPAVG").unwrap() - 0.015625).abs() < 1e-12);
    }

    #[test]
    fn update_overwrites_in_place() {
        let mut b = buf();
        let mut c = Cards::new(&mut b);
        c.clear();
        c.put_int("PKTIDX", 0).unwrap();
        c.put_int("NDROP", 3).unwrap();
        c.put_int("PKTIDX", 8192).unwrap();
        assert_eq!(c.get_int("PKTIDX").unwrap(), 8192);
        assert_eq!(c.get_int("NDROP").unwrap(), 3);
        // Two data records plus END.
        assert!(c.raw()[2 * CARD_LEN..].starts_with(b"END"));
    }

    #[test]
    fn records_are_80_columns() {
        let mut b = buf();
        let mut c = Cards::new(&mut b);
        c.clear();
        c.put_str("NETSTAT", "receiving").unwrap();
        let card = &c.raw()[..CARD_LEN];
        assert_eq!(&card[..8], b"NETSTAT ");
        assert_eq!(card[8], b'=');
        assert_eq!(card.len(), CARD_LEN);
        assert_eq!(*card.last().unwrap(), b' ');
    }

    #[test]
    fn lookup_stops_at_end_record() {
        let mut b = buf();
        let mut c = Cards::new(&mut b);
        c.clear();
        c.put_int("NBIN", 256).unwrap();
        // Scribble a fake record after END; it must stay invisible.
        let off = 3 * CARD_LEN;
        b[off..off + 8].copy_from_slice(b"GHOST   ");
        let c = Cards::new(&mut b);
        assert!(matches!(c.get_int("GHOST"), Err(CardsError::Missing(_))));
    }

    #[test]
    fn full_buffer_is_reported() {
        let mut b = vec![0u8; 2 * CARD_LEN];
        let mut c = Cards::new(&mut b);
        c.clear();
        c.put_int("ONE", 1).unwrap();
        assert_eq!(
            c.put_int("TWO", 2),
            Err(CardsError::Full("TWO".to_string()))
        );
    }

    #[test]
    fn uninitialised_buffer_detected() {
        let mut b = buf();
        let c = Cards::new(&mut b);
        assert!(!c.is_initialized());
        let mut c = Cards::new(&mut b);
        c.clear();
        assert!(c.is_initialized());
    }

    #[test]
    fn header_copy_carries_all_records() {
        let mut src = buf();
        let mut c = Cards::new(&mut src);
        c.clear();
        c.put_str("OBS_MODE", "SEARCH").unwrap();
        c.put_int("NBIN", 64).unwrap();
        let mut dst = buf();
        let mut d = Cards::new(&mut dst);
        d.copy_from(&src);
        d.put_str("OBS_MODE", "PSR").unwrap();
        assert_eq!(d.get_str("OBS_MODE").unwrap(), "PSR");
        assert_eq!(d.get_int("NBIN").unwrap(), 64);
    }
}
