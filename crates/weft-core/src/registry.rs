//! Static registry: interned images and instructions.
//!
//! Images (the main executable and each loaded library) and static
//! instructions (image + offset) are interned once and given stable 32-bit
//! ids. The ids are what the persisted databases reference, so reopening a
//! database against the same registry file preserves identity across runs.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::dbfile;
use crate::event::Address;

pub type ImageId = u32;
pub type InstId = u32;

/// Name given to code that has no owning image (JIT pages, synthesized
/// instructions for events the instrumentation driver could not resolve).
pub const PSEUDO_IMAGE_NAME: &str = "PSEUDO_IMAGE";

/// Source location attached to an instruction when debug info is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub file_name: String,
    pub line: u32,
    pub column: u32,
}

/// A main executable or library image.
#[derive(Debug)]
pub struct Image {
    id: ImageId,
    name: String,
}

impl Image {
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name without the directory part.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Whether this image is one of the common system libraries whose
    /// events rank below application events during candidate selection.
    pub fn is_common_lib(&self) -> bool {
        const COMMON: &[&str] = &[
            "libc", "libpthread", "ld-", "libstdc++", "libgcc_s", "libm",
            "libnsl", "librt", "libdl", "libz", "libcrypt", "libdb",
            "libexpat", "libbz2",
        ];
        COMMON.iter().any(|lib| self.short_name().contains(lib))
    }

    pub fn is_libc(&self) -> bool {
        self.short_name().contains("libc")
    }

    pub fn is_pthread(&self) -> bool {
        self.short_name().contains("libpthread")
    }

    pub fn is_pseudo(&self) -> bool {
        self.name == PSEUDO_IMAGE_NAME
    }
}

/// A static instruction: an image plus an offset into it.
///
/// Opcode and debug info are filled in lazily the first time the
/// instrumentation driver resolves them.
#[derive(Debug)]
pub struct Inst {
    id: InstId,
    image: Arc<Image>,
    offset: Address,
    opcode: OnceLock<u32>,
    debug_info: OnceLock<DebugInfo>,
}

impl Inst {
    pub fn id(&self) -> InstId {
        self.id
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn offset(&self) -> Address {
        self.offset
    }

    pub fn opcode(&self) -> Option<u32> {
        self.opcode.get().copied()
    }

    pub fn set_opcode(&self, opcode: u32) {
        let _ = self.opcode.set(opcode);
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.get()
    }

    pub fn set_debug_info(&self, info: DebugInfo) {
        let _ = self.debug_info.set(info);
    }

    /// `image +offset (file +line)` — the form used in reports and logs.
    pub fn to_display_string(&self) -> String {
        let mut s = format!("{} +{:#x}", self.image.short_name(), self.offset);
        if let Some(di) = self.debug_info() {
            let file = di.file_name.rsplit('/').next().unwrap_or(&di.file_name);
            s.push_str(&format!(" ({file} +{})", di.line));
        }
        s
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageMsg {
    id: ImageId,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstMsg {
    id: InstId,
    image_id: ImageId,
    offset: Address,
    opcode: Option<u32>,
    debug_info: Option<DebugInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryMsg {
    images: Vec<ImageMsg>,
    insts: Vec<InstMsg>,
}

#[derive(Default)]
struct RegistryState {
    curr_image_id: ImageId,
    curr_inst_id: InstId,
    images_by_name: HashMap<String, Arc<Image>>,
    images_by_id: HashMap<ImageId, Arc<Image>>,
    insts_by_id: HashMap<InstId, Arc<Inst>>,
    insts_by_loc: HashMap<(ImageId, Address), Arc<Inst>>,
}

/// Thread-safe store of interned images and instructions.
pub struct StaticRegistry {
    state: Mutex<RegistryState>,
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Intern an image by name. Two images with the same name resolve to
    /// one record.
    pub fn intern_image(&self, name: &str) -> Arc<Image> {
        let mut state = self.state.lock().unwrap();
        Self::intern_image_locked(&mut state, name)
    }

    fn intern_image_locked(state: &mut RegistryState, name: &str) -> Arc<Image> {
        if let Some(image) = state.images_by_name.get(name) {
            return Arc::clone(image);
        }
        state.curr_image_id += 1;
        let image = Arc::new(Image {
            id: state.curr_image_id,
            name: name.to_string(),
        });
        state.images_by_name.insert(name.to_string(), Arc::clone(&image));
        state.images_by_id.insert(image.id, Arc::clone(&image));
        image
    }

    /// Intern the instruction at `offset` inside `image`.
    pub fn intern_inst(&self, image: &Arc<Image>, offset: Address) -> Arc<Inst> {
        let mut state = self.state.lock().unwrap();
        if let Some(inst) = state.insts_by_loc.get(&(image.id, offset)) {
            return Arc::clone(inst);
        }
        state.curr_inst_id += 1;
        let inst = Arc::new(Inst {
            id: state.curr_inst_id,
            image: Arc::clone(image),
            offset,
            opcode: OnceLock::new(),
            debug_info: OnceLock::new(),
        });
        state.insts_by_loc.insert((image.id, offset), Arc::clone(&inst));
        state.insts_by_id.insert(inst.id, Arc::clone(&inst));
        inst
    }

    /// The image for code with no owning image.
    pub fn pseudo_image(&self) -> Arc<Image> {
        self.intern_image(PSEUDO_IMAGE_NAME)
    }

    /// Synthesize an instruction in the pseudo image. Used to recover when
    /// the instrumentation driver delivers an event it could not resolve.
    pub fn pseudo_inst(&self, offset: Address) -> Arc<Inst> {
        let image = self.pseudo_image();
        self.intern_inst(&image, offset)
    }

    pub fn find_image(&self, id: ImageId) -> Option<Arc<Image>> {
        self.state.lock().unwrap().images_by_id.get(&id).cloned()
    }

    pub fn find_inst(&self, id: InstId) -> Option<Arc<Inst>> {
        self.state.lock().unwrap().insts_by_id.get(&id).cloned()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images_by_id.len()
    }

    pub fn inst_count(&self) -> usize {
        self.state.lock().unwrap().insts_by_id.len()
    }

    /// Persist every interned image and instruction.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        let mut msg = RegistryMsg::default();
        let mut images: Vec<_> = state.images_by_id.values().collect();
        images.sort_by_key(|img| img.id);
        for image in images {
            msg.images.push(ImageMsg {
                id: image.id,
                name: image.name.clone(),
            });
        }
        let mut insts: Vec<_> = state.insts_by_id.values().collect();
        insts.sort_by_key(|inst| inst.id);
        for inst in insts {
            msg.insts.push(InstMsg {
                id: inst.id,
                image_id: inst.image.id,
                offset: inst.offset,
                opcode: inst.opcode(),
                debug_info: inst.debug_info().cloned(),
            });
        }
        dbfile::save_message(path, &msg)
    }

    /// Load a registry file, restoring id assignment. The internal id
    /// counters are advanced past the maximum ids seen so later interning
    /// never collides with a persisted id.
    pub fn load(&self, path: &Path) -> io::Result<()> {
        let msg: RegistryMsg = dbfile::load_message(path)?;
        let mut state = self.state.lock().unwrap();
        for image_msg in msg.images {
            let image = Arc::new(Image {
                id: image_msg.id,
                name: image_msg.name.clone(),
            });
            state.curr_image_id = state.curr_image_id.max(image_msg.id);
            state.images_by_name.insert(image_msg.name, Arc::clone(&image));
            state.images_by_id.insert(image.id, image);
        }
        for inst_msg in msg.insts {
            let image = state
                .images_by_id
                .get(&inst_msg.image_id)
                .cloned()
                .ok_or_else(|| {
                    io::Error::other(format!(
                        "instruction {} references unknown image {}",
                        inst_msg.id, inst_msg.image_id
                    ))
                })?;
            let inst = Arc::new(Inst {
                id: inst_msg.id,
                image,
                offset: inst_msg.offset,
                opcode: OnceLock::new(),
                debug_info: OnceLock::new(),
            });
            if let Some(opcode) = inst_msg.opcode {
                inst.set_opcode(opcode);
            }
            if let Some(di) = inst_msg.debug_info {
                inst.set_debug_info(di);
            }
            state.curr_inst_id = state.curr_inst_id.max(inst_msg.id);
            state
                .insts_by_loc
                .insert((inst.image.id, inst.offset), Arc::clone(&inst));
            state.insts_by_id.insert(inst.id, inst);
        }
        Ok(())
    }
}
