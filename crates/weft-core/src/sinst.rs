//! Shared-instruction database.
//!
//! A static instruction is *shared* once it has accessed a location that
//! another thread also touched. The set accumulates across runs and lets
//! analyzers skip clearly thread-local code on later executions.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::dbfile;
use crate::registry::{Inst, InstId};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SinstMsg {
    shared: Vec<InstId>,
}

/// Persistent set of instructions observed to touch shared memory.
#[derive(Debug, Default)]
pub struct SharedInstDb {
    shared: Mutex<HashSet<InstId>>,
}

impl SharedInstDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self, inst: &Arc<Inst>) -> bool {
        self.shared.lock().unwrap().contains(&inst.id())
    }

    pub fn set_shared(&self, inst: &Arc<Inst>) {
        self.shared.lock().unwrap().insert(inst.id());
    }

    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().unwrap().is_empty()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut shared: Vec<InstId> = self.shared.lock().unwrap().iter().copied().collect();
        shared.sort_unstable();
        dbfile::save_message(path, &SinstMsg { shared })
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let msg: SinstMsg = dbfile::load_message(path)?;
        self.shared.lock().unwrap().extend(msg.shared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;

    #[test]
    fn set_and_query() {
        let reg = StaticRegistry::new();
        let img = reg.intern_image("/usr/bin/app");
        let a = reg.intern_inst(&img, 0x10);
        let b = reg.intern_inst(&img, 0x20);

        let db = SharedInstDb::new();
        assert!(!db.shared(&a));
        db.set_shared(&a);
        assert!(db.shared(&a));
        assert!(!db.shared(&b));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sinst.db");
        let reg = StaticRegistry::new();
        let img = reg.intern_image("/usr/bin/app");
        let a = reg.intern_inst(&img, 0x10);

        let db = SharedInstDb::new();
        db.set_shared(&a);
        db.save(&path).unwrap();

        let db2 = SharedInstDb::new();
        db2.load(&path).unwrap();
        assert!(db2.shared(&a));
        assert_eq!(db2.len(), 1);
    }
}
