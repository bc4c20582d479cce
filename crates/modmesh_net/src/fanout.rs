use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Runs `work` over every item on at most `max_concurrency` scoped threads
/// and returns the results in input order.
///
/// Workers pull the next index from a shared cursor, so one slow item only
/// holds up its own worker. A panic in `work` is caught per item and comes
/// back as `Err` with the panic message.
pub fn scatter_gather<T, R, F>(
    items: &[T],
    max_concurrency: usize,
    work: F,
) -> Vec<Result<R, String>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = max_concurrency.clamp(1, items.len());
    if workers == 1 {
        return items.iter().map(|item| guarded(&work, item)).collect();
    }

    let cursor = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<Result<R, String>>>> =
        Mutex::new((0..items.len()).map(|_| None).collect());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(item) = items.get(index) else {
                    break;
                };
                let result = guarded(&work, item);
                let mut slots = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                slots[index] = Some(result);
            });
        }
    });
    slots
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .flatten()
        .collect()
}

fn guarded<T, R, F>(work: &F, item: &T) -> Result<R, String>
where
    F: Fn(&T) -> R,
{
    panic::catch_unwind(AssertUnwindSafe(|| work(item)))
        .map_err(|panic| panic_message(panic.as_ref()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn results_keep_input_order() {
        let items: Vec<u64> = (0..20).collect();
        let results = scatter_gather(&items, 4, |value| {
            thread::sleep(Duration::from_millis(20 - *value));
            value * 2
        });
        assert_eq!(
            results,
            items.iter().map(|value| Ok(value * 2)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn concurrency_is_bounded_and_used() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = vec![(); 12];
        let started = Instant::now();
        scatter_gather(&items, 3, |_| {
            let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now_active, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
        assert!(started.elapsed() < Duration::from_millis(12 * 30));
    }

    #[test]
    fn empty_input_spawns_nothing() {
        let results = scatter_gather(&Vec::<u8>::new(), 8, |value| *value);
        assert!(results.is_empty());
    }

    #[test]
    fn panicking_item_is_reported_in_its_slot() {
        let items: Vec<u32> = (0..6).collect();
        for concurrency in [1, 3] {
            let results = scatter_gather(&items, concurrency, |value| {
                if *value == 2 {
                    panic!("item {} exploded", value);
                }
                *value
            });
            assert_eq!(results.len(), 6);
            assert_eq!(results[2], Err("item 2 exploded".to_string()));
            assert_eq!(results[5], Ok(5));
        }
    }
}
