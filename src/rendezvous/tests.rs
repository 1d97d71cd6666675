use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::test::{TestHal, VmHarness};
use crate::VmConfig;

const POLICIES: [RendezvousPolicy; 5] = [
    RendezvousPolicy::OneByOne,
    RendezvousPolicy::AllAtOnce,
    RendezvousPolicy::Ascending,
    RendezvousPolicy::Descending,
    RendezvousPolicy::Once,
];

type TestVm = Vm<TestHal>;
type TestVCpu = VCpu<TestHal>;

fn counter() -> (Arc<AtomicUsize>, impl Fn(&TestVm, &TestVCpu) -> StrictStatus + Send + Sync) {
    let calls = Arc::new(AtomicUsize::new(0));
    let inner = calls.clone();
    (calls, move |_: &TestVm, _: &TestVCpu| {
        inner.fetch_add(1, Ordering::SeqCst);
        StrictStatus::SUCCESS
    })
}

fn full_counts(count: usize) -> SessionCounts {
    SessionCounts {
        entered: count as u32,
        done: count as u32,
        returned: count as u32,
    }
}

#[test]
fn test_every_policy_reaches_every_vcpu() {
    for count in [1, 2, 4] {
        let harness = VmHarness::start(count);
        let vm = &harness.vm;
        for policy in POLICIES {
            let (calls, callback) = counter();
            let status = vm
                .rendezvous(policy, RendezvousFlags::empty(), callback)
                .unwrap();
            assert_eq!(status, StrictStatus::SUCCESS);

            let expected = if policy == RendezvousPolicy::Once { 1 } else { count };
            assert_eq!(
                calls.load(Ordering::SeqCst),
                expected,
                "{:?} with {} vcpus",
                policy,
                count
            );
            assert_eq!(vm.rendezvous_counts(), full_counts(count));
            assert!(!vm.is_rendezvous_pending());
            assert!(vm.rendezvous_session().is_none());
        }
    }
}

#[test]
fn test_one_by_one_never_overlaps() {
    let harness = VmHarness::start(4);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let (a, m) = (active.clone(), max_active.clone());

    harness
        .vm
        .rendezvous(RendezvousPolicy::OneByOne, RendezvousFlags::empty(), move |_, _| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            a.fetch_sub(1, Ordering::SeqCst);
            StrictStatus::SUCCESS
        })
        .unwrap();

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[test]
fn test_ordered_policies() {
    let harness = VmHarness::start(4);
    for (policy, expected) in [
        (RendezvousPolicy::Ascending, vec![0, 1, 2, 3]),
        (RendezvousPolicy::Descending, vec![3, 2, 1, 0]),
    ] {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        harness
            .vm
            .rendezvous(policy, RendezvousFlags::empty(), move |_, vcpu| {
                o.lock().unwrap().push(vcpu.id());
                StrictStatus::SUCCESS
            })
            .unwrap();
        assert_eq!(*order.lock().unwrap(), expected, "{:?}", policy);
    }
}

#[test]
fn test_all_at_once_runs_concurrently() {
    let harness = VmHarness::start(4);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let (a, m) = (active.clone(), max_active.clone());

    let start = Instant::now();
    harness
        .vm
        .rendezvous(RendezvousPolicy::AllAtOnce, RendezvousFlags::empty(), move |_, _| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            a.fetch_sub(1, Ordering::SeqCst);
            StrictStatus::SUCCESS
        })
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
    assert_eq!(max_active.load(Ordering::SeqCst), 4);
}

#[test]
fn test_once_runs_a_single_callback() {
    let harness = VmHarness::start(4);
    let runners = Arc::new(Mutex::new(Vec::new()));
    let r = runners.clone();
    let status = harness
        .vm
        .rendezvous(RendezvousPolicy::Once, RendezvousFlags::empty(), move |_, vcpu| {
            r.lock().unwrap().push(vcpu.id());
            StrictStatus::info(4)
        })
        .unwrap();
    assert_eq!(status, StrictStatus::info(4));
    assert_eq!(runners.lock().unwrap().len(), 1);
}

#[test]
fn test_stop_on_error_needs_serialized_policy() {
    let vm = TestVm::new(VmConfig::with_vcpus(4)).unwrap();
    for policy in [RendezvousPolicy::AllAtOnce, RendezvousPolicy::Once] {
        let (calls, callback) = counter();
        let result = vm.rendezvous(policy, RendezvousFlags::STOP_ON_ERROR, callback);
        assert!(matches!(result, Err(VmmError::ContractViolation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!vm.is_rendezvous_pending());
        assert_eq!(vm.pending_requests(), 0);
    }
}

#[test]
fn test_stop_on_error_skips_remaining_callbacks() {
    let harness = VmHarness::start(4);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let result = harness.vm.rendezvous(
        RendezvousPolicy::Ascending,
        RendezvousFlags::STOP_ON_ERROR,
        move |_, vcpu| {
            c.fetch_add(1, Ordering::SeqCst);
            if vcpu.id() == 1 {
                StrictStatus::failure(5)
            } else {
                StrictStatus::SUCCESS
            }
        },
    );

    assert_eq!(result, Err(VmmError::Callback(StrictStatus::failure(5))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.vm.rendezvous_counts(), full_counts(4));
}

#[test]
fn test_first_failure_wins() {
    let harness = VmHarness::start(4);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let result = harness.vm.rendezvous(
        RendezvousPolicy::Descending,
        RendezvousFlags::empty(),
        move |_, vcpu| {
            c.fetch_add(1, Ordering::SeqCst);
            StrictStatus::failure(10 + vcpu.id() as u16)
        },
    );

    assert_eq!(result, Err(VmmError::Callback(StrictStatus::failure(13))));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_most_urgent_info_status_wins() {
    let harness = VmHarness::start(4);
    for policy in [RendezvousPolicy::OneByOne, RendezvousPolicy::AllAtOnce] {
        let status = harness
            .vm
            .rendezvous(policy, RendezvousFlags::empty(), |_, vcpu| match vcpu.id() {
                1 => StrictStatus::info(7),
                2 => StrictStatus::info(3),
                _ => StrictStatus::SUCCESS,
            })
            .unwrap();
        assert_eq!(status, StrictStatus::info(3), "{:?}", policy);
    }
}

#[test]
fn test_nested_rendezvous_restores_parent() {
    let harness = VmHarness::start(4);
    let order = Arc::new(Mutex::new(Vec::new()));
    let restored = Arc::new(Mutex::new(Vec::new()));
    let deepest = Arc::new(Mutex::new(None));

    let depth2: RendezvousFn<TestHal> = {
        let (order, restored, deepest) = (order.clone(), restored.clone(), deepest.clone());
        Arc::new(move |vm: &TestVm, vcpu: &TestVCpu| {
            order.lock().unwrap().push((2, vcpu.id()));
            if vcpu.id() == 0 {
                let before = vm.rendezvous_session();
                let result = vm.rendezvous(
                    RendezvousPolicy::OneByOne,
                    RendezvousFlags::empty(),
                    |_, _| StrictStatus::SUCCESS,
                );
                restored.lock().unwrap().push(before == vm.rendezvous_session());
                *deepest.lock().unwrap() = Some(result);
            }
            StrictStatus::SUCCESS
        })
    };
    let depth1: RendezvousFn<TestHal> = {
        let (order, restored) = (order.clone(), restored.clone());
        Arc::new(move |vm: &TestVm, vcpu: &TestVCpu| {
            order.lock().unwrap().push((1, vcpu.id()));
            if vcpu.id() == 0 {
                let before = vm.rendezvous_session();
                let at_depth_one = before.as_ref().map(|info| info.depth) == Some(1);
                let result = vm.rendezvous_with(
                    RendezvousPolicy::Descending,
                    RendezvousFlags::empty(),
                    depth2.clone(),
                );
                restored
                    .lock()
                    .unwrap()
                    .push(at_depth_one && before == vm.rendezvous_session() && result.is_ok());
            }
            StrictStatus::SUCCESS
        })
    };

    let (o, r) = (order.clone(), restored.clone());
    let status = harness
        .vm
        .rendezvous(RendezvousPolicy::OneByOne, RendezvousFlags::empty(), move |vm, vcpu| {
            o.lock().unwrap().push((0, vcpu.id()));
            if vcpu.id() == 0 {
                let before = vm.rendezvous_session();
                let result = vm.rendezvous_with(
                    RendezvousPolicy::Ascending,
                    RendezvousFlags::empty(),
                    depth1.clone(),
                );
                r.lock()
                    .unwrap()
                    .push(before == vm.rendezvous_session() && result.is_ok());
            }
            StrictStatus::SUCCESS
        })
        .unwrap();

    assert_eq!(status, StrictStatus::SUCCESS);
    assert_eq!(*restored.lock().unwrap(), vec![true, true, true]);
    assert_eq!(
        *deepest.lock().unwrap(),
        Some(Err(VmmError::Deadlock { depth: 2 }))
    );

    let order = order.lock().unwrap();
    let at = |depth: usize| -> Vec<usize> {
        order
            .iter()
            .filter(|(d, _)| *d == depth)
            .map(|(_, id)| *id)
            .collect()
    };
    assert_eq!(at(0).len(), 4);
    assert_eq!(at(1), vec![0, 1, 2, 3]);
    assert_eq!(at(2), vec![3, 2, 1, 0]);
    assert_eq!(harness.vm.rendezvous_counts(), full_counts(4));
    assert!(harness.vm.rendezvous_session().is_none());
}

#[test]
fn test_nested_under_once() {
    let harness = VmHarness::start(3);
    let (calls, callback) = counter();
    let callback: RendezvousFn<TestHal> = Arc::new(callback);
    let status = harness
        .vm
        .rendezvous(RendezvousPolicy::Once, RendezvousFlags::empty(), move |vm, _| {
            match vm.rendezvous_with(
                RendezvousPolicy::OneByOne,
                RendezvousFlags::empty(),
                callback.clone(),
            ) {
                Ok(status) => status,
                Err(_) => StrictStatus::failure(1),
            }
        })
        .unwrap();
    assert_eq!(status, StrictStatus::SUCCESS);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_nested_under_once_restores_parent_counts() {
    let harness = VmHarness::start(4);
    let (calls, callback) = counter();
    let callback: RendezvousFn<TestHal> = Arc::new(callback);
    let restored = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..50 {
        let callback = callback.clone();
        let restored = restored.clone();
        let status = harness
            .vm
            .rendezvous(RendezvousPolicy::Once, RendezvousFlags::empty(), move |vm, _| {
                let status = vm
                    .rendezvous_with(
                        RendezvousPolicy::OneByOne,
                        RendezvousFlags::empty(),
                        callback.clone(),
                    )
                    .unwrap_or(StrictStatus::failure(1));
                // Every bystander is done, only the driver is still running.
                restored.lock().unwrap().push(vm.rendezvous_counts());
                status
            })
            .unwrap();
        assert_eq!(status, StrictStatus::SUCCESS);
        assert_eq!(harness.vm.rendezvous_counts(), full_counts(4));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 50 * 4);
    let expected = SessionCounts {
        entered: 4,
        done: 3,
        returned: 0,
    };
    assert!(restored.lock().unwrap().iter().all(|counts| *counts == expected));
}

#[test]
fn test_nesting_under_all_at_once_deadlocks() {
    let harness = VmHarness::start(4);
    let nested = Arc::new(Mutex::new(None));
    let n = nested.clone();
    let status = harness
        .vm
        .rendezvous(RendezvousPolicy::AllAtOnce, RendezvousFlags::empty(), move |vm, vcpu| {
            if vcpu.id() == 2 {
                let result = vm.rendezvous(
                    RendezvousPolicy::OneByOne,
                    RendezvousFlags::empty(),
                    |_, _| StrictStatus::SUCCESS,
                );
                *n.lock().unwrap() = Some(result);
            }
            StrictStatus::SUCCESS
        })
        .unwrap();

    assert_eq!(status, StrictStatus::SUCCESS);
    let nested = nested.lock().unwrap().clone();
    assert_eq!(nested, Some(Err(VmmError::Deadlock { depth: 0 })));
    assert!(VmmError::Deadlock { depth: 0 }.is_fatal());
}

#[test]
fn test_single_vcpu_nesting_limit() {
    let harness = VmHarness::start(1);
    let results = Arc::new(Mutex::new(Vec::new()));
    let r = results.clone();
    let status = harness
        .vm
        .rendezvous(RendezvousPolicy::Ascending, RendezvousFlags::empty(), move |vm, _| {
            let r = r.clone();
            let inner = vm.rendezvous(
                RendezvousPolicy::OneByOne,
                RendezvousFlags::empty(),
                move |vm, _| {
                    let before = vm.rendezvous_session();
                    let deepest = vm.rendezvous(
                        RendezvousPolicy::Once,
                        RendezvousFlags::empty(),
                        |vm, _| {
                            vm.rendezvous(RendezvousPolicy::Once, RendezvousFlags::empty(), |_, _| {
                                StrictStatus::SUCCESS
                            })
                            .err()
                            .map_or(StrictStatus::SUCCESS, |_| StrictStatus::info(9))
                        },
                    );
                    let same = before == vm.rendezvous_session();
                    r.lock().unwrap().push((deepest, same));
                    StrictStatus::SUCCESS
                },
            );
            inner.unwrap_or(StrictStatus::failure(1))
        })
        .unwrap();

    assert_eq!(status, StrictStatus::SUCCESS);
    // The third level ran, the fourth was refused.
    assert_eq!(
        *results.lock().unwrap(),
        vec![(Ok(StrictStatus::info(9)), true)]
    );
}

#[test]
fn test_concurrent_initiators() {
    let harness = VmHarness::start(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let initiators: Vec<_> = (0..2)
        .map(|i| {
            let vm = harness.vm.clone();
            let calls = calls.clone();
            thread::spawn(move || {
                let flags = if i == 0 {
                    RendezvousFlags::PRIORITY
                } else {
                    RendezvousFlags::empty()
                };
                for _ in 0..10 {
                    let c = calls.clone();
                    vm.rendezvous(RendezvousPolicy::OneByOne, flags, move |_, _| {
                        c.fetch_add(1, Ordering::SeqCst);
                        StrictStatus::SUCCESS
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in initiators {
        handle.join().unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2 * 10 * 3);
    assert_eq!(harness.vm.pending_requests(), 0);
}

#[test]
fn test_destroying_vm_runs_on_caller_only() {
    let vm = TestVm::new(VmConfig::with_vcpus(4)).unwrap();
    vm.init_vcpu(0).unwrap();
    vm.start_vcpu(0).unwrap();
    vm.begin_destroy();

    TestHal::set_current_vcpu(Some(0));
    let (calls, callback) = counter();
    let status = vm
        .rendezvous(RendezvousPolicy::AllAtOnce, RendezvousFlags::empty(), callback)
        .unwrap();
    TestHal::set_current_vcpu(None);

    assert_eq!(status, StrictStatus::SUCCESS);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(vm.rendezvous_counts(), full_counts(1));
    assert!(!vm.is_rendezvous_pending());
}

#[test]
fn test_nothing_pending() {
    let vm = TestVm::new(VmConfig::with_vcpus(2)).unwrap();
    let vcpu = vm.vcpu(1).unwrap();
    assert_eq!(vm.process_rendezvous(vcpu), Ok(StrictStatus::SUCCESS));
    assert_eq!(vm.process_forced_actions(vcpu), Ok(StrictStatus::SUCCESS));
    assert!(!vcpu.in_rendezvous());
}
