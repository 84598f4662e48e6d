//! Subscriber (UE) records and the directory indexing them by IMSI and TMSI.

use crate::error::BtsError;
use arrayvec::ArrayString;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub const TMSI_LEN: usize = 8;

// TMSI values with both top bits set are P-TMSIs
const PTMSI_MASK: u32 = 0xC000_0000;
const TMSI_LOCAL_MASK: u32 = 0x3FFF_FFFF;

pub type Tmsi = ArrayString<TMSI_LEN>;

#[derive(Debug, Default, Clone)]
pub struct UeState {
    pub imei: String,
    pub msisdn: String,
    pub registered: bool,
    pub imsi_detached: bool,
    pub removed: bool,
    /// Expiry in seconds since the epoch, 0 for never.
    pub expires: u64,
    pub page_count: u32,
    /// Identity used in the current paging request, empty when not paging.
    pub paging: String,
    pub imei_requested: bool,
}

#[derive(Debug)]
pub struct Ue {
    imsi: String,
    tmsi: Tmsi,
    state: Mutex<UeState>,
}

impl Ue {
    pub fn new(imsi: &str, tmsi: Tmsi) -> Self {
        Self {
            imsi: imsi.to_string(),
            tmsi,
            state: Mutex::new(UeState::default()),
        }
    }

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn tmsi(&self) -> &str {
        self.tmsi.as_str()
    }

    pub fn lock(&self) -> MutexGuard<'_, UeState> {
        self.state.lock()
    }

    pub fn imei(&self) -> String {
        self.state.lock().imei.clone()
    }

    pub fn msisdn(&self) -> String {
        self.state.lock().msisdn.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().imsi_detached
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn is_paging(&self) -> bool {
        !self.state.lock().paging.is_empty()
    }

    pub fn paging_key(&self) -> String {
        self.state.lock().paging.clone()
    }

    /// Calling party presented for this subscriber.
    pub fn caller(&self) -> Option<String> {
        let st = self.state.lock();
        if !st.msisdn.is_empty() {
            Some(format!("+{}", st.msisdn))
        } else if !self.imsi.is_empty() {
            Some(format!("IMSI{}", self.imsi))
        } else if !st.imei.is_empty() {
            Some(format!("IMEI{}", st.imei))
        } else {
            None
        }
    }

    /// Identity text sent in a paging request.
    pub fn paging_identity(&self) -> Option<String> {
        if !self.tmsi.is_empty() {
            return Some(format!("TMSI{}", self.tmsi));
        }
        if !self.imsi.is_empty() {
            return Some(format!("IMSI{}", self.imsi));
        }
        let st = self.state.lock();
        (!st.imei.is_empty()).then(|| format!("IMEI{}", st.imei))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UeRecord {
    tmsi: String,
    imsi: String,
    #[serde(default)]
    imei: String,
    #[serde(default)]
    msisdn: String,
    #[serde(default)]
    expires: u64,
    #[serde(default)]
    registered: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UeFile {
    tmsi_index: u32,
    #[serde(default)]
    ues: Vec<UeRecord>,
}

#[derive(Default)]
struct UeTable {
    by_imsi: HashMap<String, Arc<Ue>>,
    by_tmsi: HashMap<Tmsi, Weak<Ue>>,
    tmsi_index: u32,
}

impl UeTable {
    fn new_tmsi(&mut self) -> Tmsi {
        loop {
            let mut t = self.tmsi_index.wrapping_add(1);
            self.tmsi_index = t;
            if t & PTMSI_MASK == PTMSI_MASK {
                t &= TMSI_LOCAL_MASK;
                self.tmsi_index = t;
            }
            let mut tmsi = Tmsi::new();
            // 8 hex digits always fit
            let _ = std::fmt::Write::write_fmt(&mut tmsi, format_args!("{t:08x}"));
            if !self.by_tmsi.contains_key(&tmsi) {
                return tmsi;
            }
        }
    }

    fn insert(&mut self, ue: Arc<Ue>) {
        self.by_tmsi.insert(ue.tmsi, Arc::downgrade(&ue));
        self.by_imsi.insert(ue.imsi.clone(), ue);
    }
}

/// Subscriber directory. Owns every UE; the TMSI index only refers to them.
pub struct UeDirectory {
    table: Mutex<UeTable>,
    file: Option<PathBuf>,
    save_tmsi: bool,
    dirty: AtomicBool,
}

impl UeDirectory {
    pub fn new(file: Option<PathBuf>, save_tmsi: bool) -> Self {
        let dir = Self {
            table: Mutex::new(UeTable::default()),
            file,
            save_tmsi,
            dirty: AtomicBool::new(false),
        };
        if let Err(e) = dir.load() {
            warn!("Failed to load UE list: {}", e);
        }
        dir
    }

    pub fn len(&self) -> usize {
        self.table.lock().by_imsi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tmsi_index(&self) -> u32 {
        self.table.lock().tmsi_index
    }

    pub fn set_tmsi_index(&self, index: u32) {
        self.table.lock().tmsi_index = index;
    }

    /// Allocate a TMSI without creating a subscriber.
    pub fn new_tmsi(&self) -> Tmsi {
        let tmsi = self.table.lock().new_tmsi();
        self.mark_dirty();
        tmsi
    }

    pub fn find_by_tmsi(&self, tmsi: &str) -> Option<Arc<Ue>> {
        let key = Tmsi::from(tmsi).ok()?;
        self.table.lock().by_tmsi.get(&key).and_then(Weak::upgrade)
    }

    pub fn find_by_imsi(&self, imsi: &str) -> Option<Arc<Ue>> {
        self.table.lock().by_imsi.get(imsi).cloned()
    }

    pub fn get_or_create(&self, imsi: &str) -> Option<Arc<Ue>> {
        if imsi.is_empty() {
            return None;
        }
        let mut table = self.table.lock();
        if let Some(ue) = table.by_imsi.get(imsi) {
            return Some(Arc::clone(ue));
        }
        let tmsi = table.new_tmsi();
        let ue = Arc::new(Ue::new(imsi, tmsi));
        table.insert(Arc::clone(&ue));
        drop(table);
        info!("Added UE IMSI={} TMSI={}", imsi, tmsi);
        self.mark_dirty();
        Some(ue)
    }

    fn find_with<F>(&self, pred: F) -> Option<Arc<Ue>>
    where
        F: Fn(&Ue, &UeState) -> bool,
    {
        let table = self.table.lock();
        table
            .by_imsi
            .values()
            .find(|ue| pred(ue, &ue.lock()))
            .cloned()
    }

    pub fn find_by_imei(&self, imei: &str) -> Option<Arc<Ue>> {
        if imei.is_empty() {
            return None;
        }
        self.find_with(|_, st| st.imei == imei)
    }

    pub fn find_by_msisdn(&self, msisdn: &str) -> Option<Arc<Ue>> {
        if msisdn.is_empty() {
            return None;
        }
        self.find_with(|_, st| st.msisdn == msisdn)
    }

    /// UE currently paged with `key` (`TMSI...`, `IMSI...`, `IMEI...`).
    pub fn find_paging(&self, key: &str) -> Option<Arc<Ue>> {
        if key.is_empty() {
            return None;
        }
        self.find_with(|_, st| st.paging == key)
    }

    /// Resolve a routing destination: `+msisdn`, `IMSI..`, `IMEI..` or `TMSI..`.
    pub fn find(&self, dest: &str) -> Option<Arc<Ue>> {
        if let Some(msisdn) = dest.strip_prefix('+') {
            self.find_by_msisdn(msisdn)
        } else if let Some(imsi) = dest.strip_prefix("IMSI") {
            self.find_by_imsi(imsi)
        } else if let Some(imei) = dest.strip_prefix("IMEI") {
            self.find_by_imei(imei)
        } else if let Some(tmsi) = dest.strip_prefix("TMSI") {
            self.find_by_tmsi(tmsi)
        } else {
            None
        }
    }

    /// Push the expiry of `ue` forward. Never shortens it.
    pub fn update_expire(&self, ue: &Ue, now_secs: u64, expire_secs: u64) {
        if expire_secs == 0 {
            return;
        }
        let exp = now_secs + expire_secs;
        let mut st = ue.lock();
        if exp <= st.expires {
            return;
        }
        st.expires = exp;
        drop(st);
        debug!("Updated TMSI={} IMSI={} expiration time", ue.tmsi(), ue.imsi());
        self.mark_dirty();
    }

    /// Remove and return subscribers whose expiry has passed.
    pub fn evict_expired(&self, now_secs: u64) -> Vec<Arc<Ue>> {
        let mut table = self.table.lock();
        let expired: Vec<Arc<Ue>> = table
            .by_imsi
            .values()
            .filter(|ue| {
                let st = ue.lock();
                st.expires != 0 && st.expires < now_secs
            })
            .cloned()
            .collect();
        for ue in &expired {
            table.by_imsi.remove(ue.imsi());
            table.by_tmsi.remove(&ue.tmsi);
        }
        drop(table);
        for ue in &expired {
            ue.lock().removed = true;
            info!("Removed UE IMSI={} TMSI={}: expired", ue.imsi(), ue.tmsi());
        }
        if !expired.is_empty() {
            self.mark_dirty();
        }
        expired
    }

    pub fn all(&self) -> Vec<Arc<Ue>> {
        self.table.lock().by_imsi.values().cloned().collect()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Write the table out when it changed since the last save.
    pub fn save_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.save() {
            warn!("Failed to save UE list: {}", e);
            self.mark_dirty();
        }
    }

    pub fn save(&self) -> Result<usize, BtsError> {
        let Some(path) = &self.file else {
            return Ok(0);
        };
        let file = {
            let table = self.table.lock();
            let ues = if self.save_tmsi {
                table
                    .by_imsi
                    .values()
                    .map(|ue| {
                        let st = ue.lock();
                        UeRecord {
                            tmsi: ue.tmsi().to_string(),
                            imsi: ue.imsi().to_string(),
                            imei: st.imei.clone(),
                            msisdn: st.msisdn.clone(),
                            expires: st.expires,
                            registered: st.registered,
                        }
                    })
                    .collect()
            } else {
                Vec::new()
            };
            UeFile {
                tmsi_index: table.tmsi_index,
                ues,
            }
        };
        let text = serde_json::to_string_pretty(&file).map_err(|e| BtsError::Store(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| BtsError::Store(e.to_string()))?;
        debug!("Saved {} TMSI records, index={}", file.ues.len(), file.tmsi_index);
        Ok(file.ues.len())
    }

    pub fn load(&self) -> Result<usize, BtsError> {
        let Some(path) = &self.file else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let text = std::fs::read_to_string(path).map_err(|e| BtsError::Store(e.to_string()))?;
        let file: UeFile = serde_json::from_str(&text).map_err(|e| BtsError::Store(e.to_string()))?;
        let mut table = self.table.lock();
        table.tmsi_index = file.tmsi_index;
        let mut count = 0;
        for rec in file.ues {
            let tmsi = match Tmsi::from(&rec.tmsi) {
                Ok(t) if t.len() == TMSI_LEN && !rec.imsi.is_empty() => t,
                _ => {
                    warn!("Invalid record for TMSI '{}' in {}", rec.tmsi, path.display());
                    continue;
                }
            };
            let ue = Ue::new(&rec.imsi, tmsi);
            {
                let mut st = ue.lock();
                st.imei = rec.imei;
                st.msisdn = rec.msisdn;
                st.expires = rec.expires;
                st.registered = rec.registered;
            }
            table.insert(Arc::new(ue));
            count += 1;
        }
        info!("Loaded {} TMSI records, index={}", count, table.tmsi_index);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bts-signal-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_tmsi_allocation_skips_reserved_pattern() {
        let dir = UeDirectory::new(None, true);
        dir.set_tmsi_index(0xBFFF_FFFF);
        let t = dir.new_tmsi();
        // 0xC0000000 is masked down to its local part
        assert_eq!(t.as_str(), "00000000");
        assert_eq!(dir.tmsi_index(), 0);
        let t = dir.new_tmsi();
        assert_eq!(t.as_str(), "00000001");
    }

    #[test]
    fn test_tmsi_allocation_probes_collisions() {
        let dir = UeDirectory::new(None, true);
        let a = dir.get_or_create("001010000000001").unwrap();
        assert_eq!(a.tmsi(), "00000001");
        dir.set_tmsi_index(0);
        let b = dir.get_or_create("001010000000002").unwrap();
        assert_eq!(b.tmsi(), "00000002");
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_lookup_by_destination() {
        let dir = UeDirectory::new(None, true);
        let ue = dir.get_or_create("001010000000009").unwrap();
        {
            let mut st = ue.lock();
            st.msisdn = "40700".into();
            st.imei = "35000000000001".into();
        }
        assert!(Arc::ptr_eq(&dir.find("+40700").unwrap(), &ue));
        assert!(Arc::ptr_eq(&dir.find("IMSI001010000000009").unwrap(), &ue));
        assert!(Arc::ptr_eq(&dir.find("IMEI35000000000001").unwrap(), &ue));
        assert!(Arc::ptr_eq(&dir.find(&format!("TMSI{}", ue.tmsi())).unwrap(), &ue));
        assert!(dir.find("40700").is_none());
        assert_eq!(ue.caller().as_deref(), Some("+40700"));
        assert_eq!(ue.paging_identity(), Some(format!("TMSI{}", ue.tmsi())));
    }

    #[test]
    fn test_expiry_eviction() {
        let dir = UeDirectory::new(None, true);
        let ue = dir.get_or_create("001010000000003").unwrap();
        dir.update_expire(&ue, 100, 50);
        assert_eq!(ue.lock().expires, 150);
        // never shortened
        dir.update_expire(&ue, 10, 50);
        assert_eq!(ue.lock().expires, 150);
        assert!(dir.evict_expired(150).is_empty());
        let gone = dir.evict_expired(151);
        assert_eq!(gone.len(), 1);
        assert!(ue.is_removed());
        assert!(dir.find_by_tmsi(ue.tmsi()).is_none());
    }

    #[test]
    fn test_persistence_round_trip() {
        let path = temp_file("persist");
        {
            let dir = UeDirectory::new(Some(path.clone()), true);
            let ue = dir.get_or_create("001010000000004").unwrap();
            ue.lock().msisdn = "123".into();
            assert_eq!(dir.save().unwrap(), 1);
        }
        let dir = UeDirectory::new(Some(path.clone()), true);
        assert_eq!(dir.tmsi_index(), 1);
        let ue = dir.find_by_tmsi("00000001").unwrap();
        assert_eq!(ue.imsi(), "001010000000004");
        assert_eq!(ue.msisdn(), "123");
        let _ = std::fs::remove_file(path);
    }
}
