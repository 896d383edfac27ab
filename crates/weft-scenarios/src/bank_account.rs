//! Bank account — atomicity violation across two critical sections.
//!
//! `deposit` and `withdraw` both read the balance under the account lock,
//! compute outside it, and write the result back under the lock again.
//! Each individual access is protected, but the read-modify-write is not:
//! a concurrent update between the two critical sections is lost.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use weft_core::exec::{Controller, Probe};
use weft_core::registry::Inst;

use crate::{Scenario, ScenarioOutcome};

struct Account {
    balance: AtomicI64,
    lock: Mutex<()>,
}

struct Insts {
    lock_get: Arc<Inst>,
    read: Arc<Inst>,
    unlock_get: Arc<Inst>,
    lock_set: Arc<Inst>,
    write: Arc<Inst>,
    unlock_set: Arc<Inst>,
}

fn get_balance(probe: &mut Probe, account: &Account, insts: &Insts) -> i64 {
    let lock_addr = &account.lock as *const _ as u64;
    let bal_addr = &account.balance as *const _ as u64;
    let guard = probe.mutex_lock(&insts.lock_get, lock_addr, || account.lock.lock().unwrap());
    let balance = probe.mem_read(&insts.read, bal_addr, 8, || {
        account.balance.load(Ordering::Relaxed)
    });
    probe.mutex_unlock(&insts.unlock_get, lock_addr, || drop(guard));
    balance
}

fn set_balance(probe: &mut Probe, account: &Account, insts: &Insts, balance: i64) {
    let lock_addr = &account.lock as *const _ as u64;
    let bal_addr = &account.balance as *const _ as u64;
    let guard = probe.mutex_lock(&insts.lock_set, lock_addr, || account.lock.lock().unwrap());
    probe.mem_write(&insts.write, bal_addr, 8, || {
        account.balance.store(balance, Ordering::Relaxed)
    });
    probe.mutex_unlock(&insts.unlock_set, lock_addr, || drop(guard));
}

/// Deposit racing a withdrawal, each atomic only per half.
pub struct BankAccount {
    pub amount: i64,
}

impl Default for BankAccount {
    fn default() -> Self {
        Self { amount: 20 }
    }
}

impl Scenario for BankAccount {
    fn name(&self) -> &'static str {
        "bank_account"
    }

    fn description(&self) -> &'static str {
        "deposit and withdraw each split their read-modify-write over two critical sections"
    }

    fn run(&self, ctrl: &Arc<Controller>) -> ScenarioOutcome {
        let image = ctrl.registry().intern_image("scenario/bank_account");
        // Deposit and withdraw carry their own copies of the get/set
        // accessors, as an inlining compiler would emit them.
        let deposit_insts = Arc::new(Insts {
            lock_get: ctrl.registry().intern_inst(&image, 0x10),
            read: ctrl.registry().intern_inst(&image, 0x14),
            unlock_get: ctrl.registry().intern_inst(&image, 0x18),
            lock_set: ctrl.registry().intern_inst(&image, 0x20),
            write: ctrl.registry().intern_inst(&image, 0x24),
            unlock_set: ctrl.registry().intern_inst(&image, 0x28),
        });
        let withdraw_insts = Arc::new(Insts {
            lock_get: ctrl.registry().intern_inst(&image, 0x40),
            read: ctrl.registry().intern_inst(&image, 0x44),
            unlock_get: ctrl.registry().intern_inst(&image, 0x48),
            lock_set: ctrl.registry().intern_inst(&image, 0x50),
            write: ctrl.registry().intern_inst(&image, 0x54),
            unlock_set: ctrl.registry().intern_inst(&image, 0x58),
        });

        let account = Arc::new(Account { balance: AtomicI64::new(0), lock: Mutex::new(()) });
        let bal_addr = &account.balance as *const _ as u64;
        let amount = self.amount;

        let mut main = ctrl.main_thread();
        main.region_alloc(bal_addr, 8);

        let mut handles = Vec::new();
        for deposit in [true, false] {
            let thd = ctrl.create_thread(Some(main.thread_id()));
            let ctrl = Arc::clone(ctrl);
            let account = Arc::clone(&account);
            let insts = if deposit {
                Arc::clone(&deposit_insts)
            } else {
                Arc::clone(&withdraw_insts)
            };
            handles.push((thd, thread::spawn(move || {
                let mut probe = ctrl.probe(thd);
                let current = get_balance(&mut probe, &account, &insts);
                probe.inst_count(1);
                let updated = if deposit { current + amount } else { current - amount };
                set_balance(&mut probe, &account, &insts, updated);
                probe.thread_exit();
            })));
        }
        for (thd, handle) in handles {
            main.join(thd, || handle.join().unwrap());
        }

        let finale = account.balance.load(Ordering::Relaxed);
        main.region_free(bal_addr);
        main.thread_exit();
        ScenarioOutcome {
            summary: format!("balance = {finale}, expected 0"),
            invariant_violated: finale != 0,
        }
    }
}
