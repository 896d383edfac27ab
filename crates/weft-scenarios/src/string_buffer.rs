//! String buffer erase racing append — same-location nested dependency.
//!
//! One thread erases the front of a shared buffer while another appends
//! the buffer into a fresh one. Both operations read and write the count
//! field without a common lock; interleaving the append between the
//! erase's read and write of `count` copies a stale length.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use weft_core::exec::{Controller, Probe};
use weft_core::registry::Inst;

use crate::{Scenario, ScenarioOutcome};

const CAPACITY: usize = 32;

struct Buffer {
    data: Vec<AtomicU8>,
    count: AtomicUsize,
}

impl Buffer {
    fn with_content(content: &[u8]) -> Self {
        let data: Vec<AtomicU8> = (0..CAPACITY)
            .map(|i| AtomicU8::new(content.get(i).copied().unwrap_or(0)))
            .collect();
        Self { data, count: AtomicUsize::new(content.len()) }
    }

    fn snapshot(&self) -> Vec<u8> {
        let n = self.count.load(Ordering::Relaxed).min(CAPACITY);
        self.data[..n].iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

struct ShiftInsts {
    count_read: Arc<Inst>,
    byte_read: Arc<Inst>,
    byte_write: Arc<Inst>,
    count_write: Arc<Inst>,
}

/// `erase(0, n)`: read count, shift bytes down, write count.
fn erase(probe: &mut Probe, buf: &Buffer, insts: &ShiftInsts, n: usize) {
    let count_addr = &buf.count as *const _ as u64;
    let len = probe.mem_read(&insts.count_read, count_addr, 8, || {
        buf.count.load(Ordering::Relaxed)
    });
    let n = n.min(len);
    for i in 0..len - n {
        let src = &buf.data[i + n] as *const _ as u64;
        let dst = &buf.data[i] as *const _ as u64;
        let byte = probe.mem_read(&insts.byte_read, src, 1, || {
            buf.data[i + n].load(Ordering::Relaxed)
        });
        probe.mem_write(&insts.byte_write, dst, 1, || {
            buf.data[i].store(byte, Ordering::Relaxed)
        });
    }
    probe.mem_write(&insts.count_write, count_addr, 8, || {
        buf.count.store(len - n, Ordering::Relaxed)
    });
}

/// Append `src` into `dst`: read src count and bytes, write dst.
fn append(probe: &mut Probe, src: &Buffer, dst: &Buffer, insts: &ShiftInsts) {
    let src_count_addr = &src.count as *const _ as u64;
    let dst_count_addr = &dst.count as *const _ as u64;
    let len = probe.mem_read(&insts.count_read, src_count_addr, 8, || {
        src.count.load(Ordering::Relaxed)
    });
    let dst_len = dst.count.load(Ordering::Relaxed);
    for i in 0..len.min(CAPACITY - dst_len) {
        let src_addr = &src.data[i] as *const _ as u64;
        let dst_addr = &dst.data[dst_len + i] as *const _ as u64;
        let byte = probe.mem_read(&insts.byte_read, src_addr, 1, || {
            src.data[i].load(Ordering::Relaxed)
        });
        probe.mem_write(&insts.byte_write, dst_addr, 1, || {
            dst.data[dst_len + i].store(byte, Ordering::Relaxed)
        });
    }
    probe.mem_write(&insts.count_write, dst_count_addr, 8, || {
        dst.count.store(dst_len + len, Ordering::Relaxed)
    });
}

#[derive(Default)]
pub struct StringBuffer;

impl Scenario for StringBuffer {
    fn name(&self) -> &'static str {
        "string_buffer"
    }

    fn description(&self) -> &'static str {
        "erase and append race over an unprotected count field"
    }

    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome {
        let image = ctrl.registry().intern_image("scenario/string_buffer");
        let erase_insts = Arc::new(ShiftInsts {
            count_read: ctrl.registry().intern_inst(&image, 0x10),
            byte_read: ctrl.registry().intern_inst(&image, 0x14),
            byte_write: ctrl.registry().intern_inst(&image, 0x18),
            count_write: ctrl.registry().intern_inst(&image, 0x1c),
        });
        let append_insts = Arc::new(ShiftInsts {
            count_read: ctrl.registry().intern_inst(&image, 0x20),
            byte_read: ctrl.registry().intern_inst(&image, 0x24),
            byte_write: ctrl.registry().intern_inst(&image, 0x28),
            count_write: ctrl.registry().intern_inst(&image, 0x2c),
        });

        let shared = Arc::new(Buffer::with_content(b"abcdefgh"));
        let target = Arc::new(Buffer::with_content(b""));
        let shared_base = shared.data.as_ptr() as u64;
        let target_base = target.data.as_ptr() as u64;

        let mut main = ctrl.main_thread();
        main.region_alloc(shared_base, CAPACITY);
        main.region_alloc(&shared.count as *const _ as u64, 8);
        main.region_alloc(target_base, CAPACITY);
        main.region_alloc(&target.count as *const _ as u64, 8);

        let eraser_thd = ctrl.create_thread(Some(main.thread_id()));
        let eraser = {
            let ctrl = Arc::clone(ctrl);
            let shared = Arc::clone(&shared);
            let erase_insts = Arc::clone(&erase_insts);
            thread::spawn(move || {
                let mut probe = ctrl.probe(eraser_thd);
                erase(&mut probe, &shared, &erase_insts, 3);
                probe.thread_exit();
            })
        };

        append(&mut main, &shared, &target, &append_insts);
        main.join(eraser_thd, || eraser.join().unwrap());

        let appended = target.snapshot();
        let consistent = appended == b"abcdefgh" || appended == b"defgh";
        main.thread_exit();
        ScenarioOutcome {
            summary: format!("appended {:?}", String::from_utf8_lossy(&appended)),
            invariant_violated: !consistent,
        }
    }
}
