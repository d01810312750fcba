use hookvm::hook::{AccessKind, Branch, BranchNotTaken, Exception, Hlt, MemType, Opcode, PhyAccess};
use hookvm::{Event, EventKind, Hook, HookAction, HookRegistry, Instr, RawInstr};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn branch() -> Event<'static> {
    Event::CnearBranchTaken(Branch {
        cpu: 0,
        from: 0x40_1000,
        to: 0x40_1020,
    })
}

#[test]
fn test_dispatch_order_is_registration_order() {
    let log: Log = Arc::default();
    let mut registry = HookRegistry::new();

    for (i, name) in ["H1", "H2", "H3"].into_iter().enumerate() {
        let mut hook = Hook::new(log.clone());
        hook.on_cnear_branch_taken(move |log: &mut Log, _| {
            log.lock().unwrap().push(name.to_string())
        });
        // Slots unrelated to the event must not change the order.
        if i == 1 {
            hook.on_hlt(|_, _| {});
        }
        let _ = registry.register(hook);
    }

    for _ in 0..3 {
        registry.dispatch(&branch());
    }
    assert_eq!(
        *log.lock().unwrap(),
        vec!["H1", "H2", "H3", "H1", "H2", "H3", "H1", "H2", "H3"]
    );
}

#[test]
fn test_hooks_without_slot_are_skipped() {
    let log: Log = Arc::default();
    let mut registry = HookRegistry::new();

    let mut first = Hook::new(log.clone());
    first.on_hlt(|log: &mut Log, _| log.lock().unwrap().push("first".into()));
    let _ = registry.register(first);
    let _ = registry.register(Hook::new(log.clone()));
    let mut third = Hook::new(log.clone());
    third.on_hlt(|log: &mut Log, _| log.lock().unwrap().push("third".into()));
    let _ = registry.register(third);

    registry.dispatch(&Event::Hlt(Hlt { cpu: 0 }));
    assert_eq!(*log.lock().unwrap(), vec!["first", "third"]);
}

#[test]
fn test_clearing_one_slot_keeps_the_others() {
    let mut registry = HookRegistry::new();
    let mut hook = Hook::new((0u32, 0u32));
    hook.on_hlt(|(hlts, _), _| *hlts += 1);
    hook.on_exception(|(_, exceptions), _| *exceptions += 1);
    let handle = registry.register(hook);

    registry.hook_mut(&handle).clear(EventKind::Hlt);

    registry.dispatch(&Event::Hlt(Hlt { cpu: 0 }));
    registry.dispatch(&Event::Exception(Exception {
        cpu: 0,
        vector: 6,
        error_code: 0,
    }));

    assert!(!registry.hook(&handle).observes(EventKind::Hlt));
    assert!(registry.hook(&handle).observes(EventKind::Exception));
    assert_eq!(registry.unregister(handle).into_ctx(), (0, 1));
}

#[test]
fn test_two_opcode_hooks_get_their_own_context() {
    let mut registry = HookRegistry::new();

    let mut a = Hook::new(("a", Vec::new()));
    a.on_opcode(|(_, seen), op| seen.push(op.bytes.len()));
    let a = registry.register(a);

    let mut b = Hook::new(("b", Vec::new()));
    b.on_opcode(|(_, seen), op| seen.push(op.instr.len()));
    let b = registry.register(b);

    let instr = RawInstr::new(0x1f, 3);
    let bytes = [0x48, 0x89, 0xc3];
    let action = registry.dispatch(&Event::Opcode(Opcode {
        cpu: 0,
        instr: &instr,
        bytes: &bytes,
        is32: false,
        is64: true,
    }));
    assert_eq!(action, HookAction::Continue);

    let b = registry.unregister(b).into_ctx();
    let a = registry.unregister(a).into_ctx();
    assert_eq!(a, ("a", vec![3]));
    assert_eq!(b, ("b", vec![3]));
}

#[test]
fn test_context_swap_between_runs() {
    let mut registry = HookRegistry::new();
    let mut hook = Hook::new(Vec::new());
    hook.on_phy_access(|gpas: &mut Vec<u64>, access| gpas.push(access.gpa));
    let handle = registry.register(hook);

    let access = |gpa| {
        Event::PhyAccess(PhyAccess {
            cpu: 0,
            gpa,
            len: 8,
            memtype: MemType::Wb,
            rw: AccessKind::Read,
        })
    };

    registry.dispatch(&access(0x1000));
    let first_run = registry.hook_mut(&handle).set_ctx(Vec::new());
    registry.dispatch(&access(0x2000));

    assert_eq!(first_run, vec![0x1000]);
    assert_eq!(*registry.hook(&handle).ctx(), vec![0x2000]);
}

#[test]
fn test_any_stop_wins() {
    let mut registry = HookRegistry::new();
    let mut quiet = Hook::new(());
    quiet.on_cnear_branch_taken(|_, _| HookAction::Continue);
    let _ = registry.register(quiet);
    let mut stopper = Hook::new(());
    stopper.on_cnear_branch_taken(|_, b| {
        if b.to == 0x40_1020 {
            HookAction::Stop
        } else {
            HookAction::Continue
        }
    });
    let _ = registry.register(stopper);

    assert_eq!(registry.dispatch(&branch()), HookAction::Stop);
    assert_eq!(
        registry.dispatch(&Event::CnearBranchNotTaken(BranchNotTaken {
            cpu: 0,
            ip: 0x40_1000,
        })),
        HookAction::Continue
    );
}

#[test]
fn test_shared_registry_across_threads() {
    let registry = HookRegistry::shared();
    let mut hook = Hook::new(Vec::new());
    hook.on_hlt(|cpus: &mut Vec<u32>, h| cpus.push(h.cpu));
    let handle = registry.lock().unwrap().register(hook);

    let threads: Vec<_> = (0..4)
        .map(|cpu| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry
                    .lock()
                    .unwrap()
                    .dispatch(&Event::Hlt(Hlt { cpu }));
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let mut cpus = registry.lock().unwrap().unregister(handle).into_ctx();
    cpus.sort();
    assert_eq!(cpus, vec![0, 1, 2, 3]);
}
