//! Circular list rotation — a two-location atomicity violation.
//!
//! Two threads rotate a list: pop the front under the list lock, bump the
//! node's value outside it, push the node back under the lock. The list
//! order invariant (values strictly increasing front to back) survives
//! only if the whole rotation is atomic; an interleaved rotation pushes
//! the nodes back in the wrong order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use weft_core::exec::Controller;

use crate::{Scenario, ScenarioOutcome};

/// Two-thread list rotation with the node update outside the lock.
pub struct CircularList {
    pub rotations: u32,
    /// List length; with a single node every rotation contends on the
    /// same payload.
    pub nodes: u64,
}

impl Default for CircularList {
    fn default() -> Self {
        Self { rotations: 2, nodes: 2 }
    }
}

impl Scenario for CircularList {
    fn name(&self) -> &'static str {
        "circular_list"
    }

    fn description(&self) -> &'static str {
        "list rotations update the popped node outside the list lock"
    }

    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome {
        let image = ctrl.registry().intern_image("scenario/circular_list");
        let inst_lock_pop = ctrl.registry().intern_inst(&image, 0x10);
        let inst_head_read = ctrl.registry().intern_inst(&image, 0x14);
        let inst_unlock_pop = ctrl.registry().intern_inst(&image, 0x18);
        let inst_node_read = ctrl.registry().intern_inst(&image, 0x20);
        let inst_node_write = ctrl.registry().intern_inst(&image, 0x24);
        let inst_lock_push = ctrl.registry().intern_inst(&image, 0x28);
        let inst_head_write = ctrl.registry().intern_inst(&image, 0x2c);
        let inst_unlock_push = ctrl.registry().intern_inst(&image, 0x30);

        // Node payloads live outside the queue so their addresses are
        // stable; the queue itself holds indices.
        let nodes: Arc<Vec<AtomicU64>> =
            Arc::new((0..self.nodes).map(|i| AtomicU64::new(i * 100)).collect());
        let list: Arc<Mutex<VecDeque<usize>>> =
            Arc::new(Mutex::new((0..self.nodes as usize).collect()));
        // The lock guards the deque; its head cell is monitored as a
        // separate location inside the same object.
        let lock_addr = Arc::as_ptr(&list) as u64;
        let head_addr = lock_addr + 16;
        let node_addr = |i: usize| &nodes[i] as *const _ as u64;

        let mut main = ctrl.main_thread();
        main.region_alloc(head_addr, 8);
        for i in 0..nodes.len() {
            main.region_alloc(node_addr(i), 8);
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let thd = ctrl.create_thread(Some(main.thread_id()));
            let ctrl = Arc::clone(ctrl);
            let nodes = Arc::clone(&nodes);
            let list = Arc::clone(&list);
            let rotations = self.rotations;
            let inst_lock_pop = Arc::clone(&inst_lock_pop);
            let inst_head_read = Arc::clone(&inst_head_read);
            let inst_unlock_pop = Arc::clone(&inst_unlock_pop);
            let inst_node_read = Arc::clone(&inst_node_read);
            let inst_node_write = Arc::clone(&inst_node_write);
            let inst_lock_push = Arc::clone(&inst_lock_push);
            let inst_head_write = Arc::clone(&inst_head_write);
            let inst_unlock_push = Arc::clone(&inst_unlock_push);
            handles.push((thd, thread::spawn(move || {
                let mut probe = ctrl.probe(thd);
                let mut done = 0;
                while done < rotations {
                    // pop_front under the lock
                    let guard = probe.mutex_lock(&inst_lock_pop, lock_addr, || {
                        list.lock().unwrap()
                    });
                    let popped = {
                        let mut guard = guard;
                        let popped = probe.mem_read(&inst_head_read, head_addr, 8, || {
                            guard.pop_front()
                        });
                        probe.mutex_unlock(&inst_unlock_pop, lock_addr, || drop(guard));
                        popped
                    };
                    let Some(idx) = popped else {
                        // Every node is mid-rotation in another thread.
                        probe.inst_count(1);
                        continue;
                    };
                    done += 1;

                    // bump the node outside the lock
                    let addr = &nodes[idx] as *const _ as u64;
                    let value = probe.mem_read(&inst_node_read, addr, 8, || {
                        nodes[idx].load(Ordering::Relaxed)
                    });
                    probe.inst_count(1);
                    probe.mem_write(&inst_node_write, addr, 8, || {
                        nodes[idx].store(value + 10, Ordering::Relaxed)
                    });

                    // push_back under the lock
                    let mut guard = probe.mutex_lock(&inst_lock_push, lock_addr, || {
                        list.lock().unwrap()
                    });
                    probe.mem_write(&inst_head_write, head_addr, 8, || {
                        guard.push_back(idx)
                    });
                    probe.mutex_unlock(&inst_unlock_push, lock_addr, || drop(guard));
                }
                probe.thread_exit();
            })));
        }
        for (thd, handle) in handles {
            main.join(thd, || handle.join().unwrap());
        }

        // Traverse: values must still increase front to back.
        let order: Vec<u64> = {
            let guard = list.lock().unwrap();
            guard.iter().map(|&i| nodes[i].load(Ordering::Relaxed)).collect()
        };
        let violated = order.windows(2).any(|w| w[0] >= w[1]);
        for i in 0..nodes.len() {
            main.region_free(node_addr(i));
        }
        main.region_free(head_addr);
        main.thread_exit();
        ScenarioOutcome {
            summary: format!("final order {order:?}"),
            invariant_violated: violated,
        }
    }
}
