use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{mpsc::sync_channel, Arc};

use parking_lot::{Condvar, Mutex};

/// Maps `produce` over `iter` on the current rayon pool size worth of
/// threads, and hands the results to `consume` in iteration order.
///
/// At most twice the number of threads results are in flight. The first
/// error returned by `consume` stops the processing and is returned.
pub fn parallel_process<Iter, Item, Producer, Data, Consumer, Error, Garbage>(
    iter: Iter,
    produce: Producer,
    mut consume: Consumer,
) -> Result<(), Error>
where
    Iter: Iterator<Item = Item> + Send,
    Producer: Fn(Item) -> Data + Sync,
    Data: Send,
    Consumer: FnMut(Data) -> Result<Garbage, Error>,
    Garbage: Send + 'static,
{
    let num_threads = rayon::current_num_threads();

    let iter = Arc::new(Mutex::new(iter.enumerate()));
    let next = Arc::new((Mutex::new(2 * num_threads), Condvar::new()));

    let result = crossbeam::scope(|s| {
        let (sender, receiver) = sync_channel(2 * num_threads);
        for _ in 0..num_threads {
            let sender = sender.clone();
            let iter = iter.clone();
            let next = &next;
            let produce = &produce;
            s.spawn(move |_| loop {
                let (i, item) = match iter.lock().next() {
                    None => break,
                    Some(x) => x,
                };

                let data = produce(item);

                let (counter, cond) = &**next;
                {
                    let mut guard = counter.lock();
                    while *guard <= i {
                        cond.wait(&mut guard);
                    }
                }

                if sender.send((i, data)).is_err() {
                    // consumer stopped early
                    break;
                }
            });
        }
        // iteration finishes once all worker senders are gone
        drop(sender);

        let (garbage_sender, garbage_receiver) = sync_channel(2 * num_threads);

        std::thread::spawn(move || {
            // heavy objects are dropped off the consumer thread
            for garbage in garbage_receiver {
                std::mem::drop(garbage);
            }
        });

        let mut pending = BTreeMap::new();
        let mut next_idx = 0;
        let mut consumed = || -> Result<(), Error> {
            for result in receiver.iter() {
                pending.insert(Reverse(result.0), result.1);
                while let Some(data) = pending.remove(&Reverse(next_idx)) {
                    {
                        let mut guard = next.0.lock();
                        *guard += 1;
                        next.1.notify_all();
                    }

                    next_idx += 1;
                    let garbage = consume(data)?;
                    // the garbage thread only exits when the sender is dropped
                    let _ = garbage_sender.send(garbage);
                }
            }
            Ok(())
        };
        let result = consumed();
        if result.is_err() {
            // release every waiting worker, their results are discarded
            *next.0.lock() = usize::MAX;
            next.1.notify_all();
        }
        result
    });

    match result {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_results_are_consumed_in_order() {
        let mut consumed = Vec::new();
        parallel_process(
            0..1000u64,
            |i| i * i,
            |v| -> Result<(), ()> {
                consumed.push(v);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(consumed, (0..1000u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_consumer_error_stops_processing() {
        let mut consumed = 0;
        let result = parallel_process(
            0..1000u64,
            |i| i,
            |v| {
                if v == 10 {
                    return Err(v);
                }
                consumed += 1;
                Ok(())
            },
        );
        assert_eq!(result, Err(10));
        assert_eq!(consumed, 10);
    }
}
