use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use tick_sync::{PeriodicSpec, Tick, TimeSpec, TriggerHandle, TriggerSet};

fn recorder(set: &mut TriggerSet, spec: PeriodicSpec) -> (TriggerHandle, Arc<Mutex<Vec<Tick>>>) {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let handle = set.subscribe(spec, 0, move |span: TimeSpec| {
        sink.lock().unwrap().push(span.start);
    });
    (handle, fired)
}

proptest! {
    #[test]
    fn every_boundary_fires_once_whatever_the_stride(
        period in 1u32..50,
        offset in 0u32..50,
        strides in prop::collection::vec(0u32..200, 1..60),
    ) {
        let mut set = TriggerSet::new();
        let (_handle, fired) = recorder(&mut set, PeriodicSpec::new(offset, period).unwrap());
        let mut tick = 0;
        for stride in strides {
            let next = tick + stride;
            set.on_tick_advance(TimeSpec::new(tick, next));
            tick = next;
        }
        let expected: Vec<Tick> = (0..=tick)
            .filter(|t| *t % period == offset % period)
            .collect();
        prop_assert_eq!(fired.lock().unwrap().clone(), expected);
    }

    #[test]
    fn rate_change_never_skips_or_repeats(
        old_period in 1u32..40,
        new_period in 1u32..40,
        change_at in 1u32..300,
    ) {
        let end = 600;
        let mut set = TriggerSet::new();
        let (handle, fired) = recorder(&mut set, PeriodicSpec::new(0, old_period).unwrap());
        set.on_tick_advance(TimeSpec::new(0, 0));
        for tick in 1..=end {
            set.on_tick_advance(TimeSpec::new(tick - 1, tick));
            if tick == change_at {
                set.change_period(&handle, new_period).unwrap();
            }
        }

        // Old grid up to the change, then the new period from the next old boundary.
        let switch = (change_at / old_period + 1) * old_period;
        let mut expected: Vec<Tick> = (0..=change_at).step_by(old_period as usize).collect();
        let mut boundary = switch;
        while boundary <= end {
            expected.push(boundary);
            boundary += new_period;
        }
        prop_assert_eq!(fired.lock().unwrap().clone(), expected);
    }
}

#[test]
fn detached_handle_rejects_changes() {
    let mut set = TriggerSet::new();
    let (handle, fired) = recorder(&mut set, PeriodicSpec::new(0, 10).unwrap());
    set.on_tick_advance(TimeSpec::new(0, 20));
    handle.detach();
    assert!(handle.change_period(5).is_err());
    set.on_tick_advance(TimeSpec::new(20, 40));
    assert_eq!(*fired.lock().unwrap(), vec![0, 10, 20]);
    assert!(set.is_empty());
}
