//! `vela-status`: the shared status area.
//!
//! One named region holds a futex mutex word followed by a card buffer.
//! Every stage publishes its phase (`NETSTAT`, `FOLDSTAT`, `NULLSTAT`) and
//! the capture stage its drop statistics here; operators watch it to tell a
//! healthy pipeline from one whose peer died mid-stream.
//!
//! All access goes through [`Status::lock`], which returns a guard deref-ing
//! to [`Cards`]. The guard releases the mutex on every exit path, so a
//! panicking stage cannot wedge the area for the others. No I/O happens
//! under the mutex.

use std::path::Path;

use thiserror::Error;
use vela_cards::Cards;
use vela_shm::{ShmMutex, ShmMutexGuard, ShmRegion, region_path};

/// Region name under the shm directory.
pub const STATUS_NAME: &str = "vela_status";

/// Card text bytes. 2304 records of 80 characters.
pub const STATUS_TEXT_LEN: usize = 2304 * 80;

/// Mutex word plus padding out to a cache line, so the lock never shares a
/// line with the first card.
const TEXT_OFFSET: usize = 64;

const STATUS_TOTAL_LEN: usize = TEXT_OFFSET + STATUS_TEXT_LEN;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to attach status region")]
    Attach(#[source] std::io::Error),
    #[error(transparent)]
    Cards(#[from] vela_cards::CardsError),
}

/// Handle to the status area. Each stage attaches its own.
pub struct Status {
    region: ShmRegion,
}

impl Status {
    /// Attach to the status area, creating and initialising it if this is
    /// the first attacher.
    pub fn attach(dir: &Path) -> Result<Self, StatusError> {
        let path = region_path(dir, STATUS_NAME);
        let region =
            ShmRegion::open_or_create(&path, STATUS_TOTAL_LEN).map_err(StatusError::Attach)?;
        let mut st = Self { region };
        {
            let mut guard = st.lock();
            if !guard.is_initialized() {
                guard.clear();
            }
        }
        Ok(st)
    }

    /// Acquire the area. The guard dereferences to the card dictionary.
    pub fn lock(&mut self) -> StatusGuard<'_> {
        let base = self.region.as_mut_ptr();
        // SAFETY: the region is at least STATUS_TOTAL_LEN long; the mutex
        // word lives at offset 0 and the text area behind TEXT_OFFSET, so
        // the two borrows never overlap. The region was zero-initialised
        // at creation, which is a valid unlocked mutex.
        let (mutex, text) = unsafe {
            (
                &*(base as *const ShmMutex),
                std::slice::from_raw_parts_mut(base.add(TEXT_OFFSET), STATUS_TEXT_LEN),
            )
        };
        let lock = mutex.lock();
        StatusGuard {
            cards: Cards::new(text),
            _lock: lock,
        }
    }

    /// Lock, write one string value, unlock.
    pub fn set_str(&mut self, key: &str, value: &str) -> Result<(), StatusError> {
        self.lock().put_str(key, value)?;
        Ok(())
    }

    /// Lock, write one double value, unlock.
    pub fn set_dbl(&mut self, key: &str, value: f64) -> Result<(), StatusError> {
        self.lock().put_dbl(key, value)?;
        Ok(())
    }

    /// Lock, write one integer value, unlock.
    pub fn set_int(&mut self, key: &str, value: i64) -> Result<(), StatusError> {
        self.lock().put_int(key, value)?;
        Ok(())
    }
}

/// Locked view of the status cards.
pub struct StatusGuard<'a> {
    cards: Cards<'a>,
    _lock: ShmMutexGuard<'a>,
}

impl<'a> std::ops::Deref for StatusGuard<'a> {
    type Target = Cards<'a>;
    fn deref(&self) -> &Self::Target {
        &self.cards
    }
}

impl<'a> std::ops::DerefMut for StatusGuard<'a> {
    fn deref_mut(&mut self) -> &mut Cards<'a> {
        &mut self.cards
    }
}
