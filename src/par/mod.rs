//! Minimal blocking parallel primitives: a chunked parallel-for over owned
//! items, a chunked map-reduce, and a bounded multi-stage pipeline. All
//! calls block until the work is fully drained; concurrency never outlives
//! the call.

use anyhow::Result;
use crossbeam_channel as channel;
use std::thread;

/// Calls `f(item_index, item, worker_id)` exactly once per item, with items
/// split into contiguous runs across at most `n_threads` worker threads.
/// Each worker exclusively owns the items it is assigned for the duration
/// of the call.
pub fn parallel_for_mut<T, F>(n_threads: usize, items: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut T, usize) + Sync,
{
    let n = items.len();
    if n == 0 {
        return;
    }
    let n_threads = n_threads.clamp(1, n);
    if n_threads == 1 {
        for (i, item) in items.iter_mut().enumerate() {
            f(i, item, 0);
        }
        return;
    }
    let chunk = n.div_ceil(n_threads);
    thread::scope(|s| {
        for (tid, run) in items.chunks_mut(chunk).enumerate() {
            let f = &f;
            let base = tid * chunk;
            s.spawn(move || {
                for (off, item) in run.iter_mut().enumerate() {
                    f(base + off, item, tid);
                }
            });
        }
    });
}

/// Maps contiguous chunks of `items` to partial results on worker threads
/// and returns the partials in chunk order. The caller reduces them; each
/// worker writes only its own partial, so no synchronization is needed.
pub fn parallel_map_chunks<T, R, F>(n_threads: usize, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&[T], usize) -> R + Sync,
{
    let n = items.len();
    let n_threads = n_threads.clamp(1, n.max(1));
    if n_threads == 1 {
        return vec![f(items, 0)];
    }
    let chunk = n.div_ceil(n_threads);
    thread::scope(|s| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .enumerate()
            .map(|(tid, run)| {
                let f = &f;
                s.spawn(move || f(run, tid))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Runs a read -> extract -> insert pipeline with bounded overlap.
///
/// `read` produces blocks until it returns `Ok(None)`; `extract` is pure CPU
/// work; `insert` consumes each extracted block. Stages communicate over
/// bounded rendezvous channels, so at most one block is in flight per stage
/// and blocks pass through every stage in input order: two `insert` calls
/// for different blocks can never overlap.
///
/// `depth` selects how many stages run concurrently: 1 runs everything on
/// the caller thread, 2 overlaps reading with extract+insert, 3 and above
/// overlap all three stages. A `read` error aborts the run and is returned
/// once in-flight blocks have drained.
pub fn pipeline<B, X, R, M, S>(depth: usize, mut read: R, mut extract: M, mut insert: S) -> Result<()>
where
    B: Send,
    X: Send,
    R: FnMut() -> Result<Option<B>> + Send,
    M: FnMut(B) -> X + Send,
    S: FnMut(X) + Send,
{
    match depth {
        0 | 1 => {
            while let Some(block) = read()? {
                insert(extract(block));
            }
            Ok(())
        }
        2 => {
            let (block_tx, block_rx) = channel::bounded::<B>(1);
            thread::scope(|s| {
                s.spawn(move || {
                    for block in block_rx {
                        insert(extract(block));
                    }
                });
                let res = feed(&mut read, &block_tx);
                drop(block_tx); // closes the channel so the scope can join
                res
            })
        }
        _ => {
            let (block_tx, block_rx) = channel::bounded::<B>(1);
            let (key_tx, key_rx) = channel::bounded::<X>(1);
            thread::scope(|s| {
                s.spawn(move || {
                    for block in block_rx {
                        if key_tx.send(extract(block)).is_err() {
                            break;
                        }
                    }
                });
                s.spawn(move || {
                    for keys in key_rx {
                        insert(keys);
                    }
                });
                let res = feed(&mut read, &block_tx);
                drop(block_tx);
                res
            })
        }
    }
}

/// Stage-0 loop: pushes blocks downstream until end of input or error.
fn feed<B>(
    read: &mut (impl FnMut() -> Result<Option<B>> + Send),
    tx: &channel::Sender<B>,
) -> Result<()> {
    loop {
        match read() {
            Ok(Some(block)) => {
                if tx.send(block).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parallel_for_mut_visits_each_item_once() {
        let mut items = vec![0u32; 1000];
        parallel_for_mut(7, &mut items, |i, item, _tid| {
            *item += i as u32 + 1;
        });
        for (i, item) in items.iter().enumerate() {
            assert_eq!(*item, i as u32 + 1);
        }
    }

    #[test]
    fn parallel_for_mut_handles_fewer_items_than_threads() {
        let mut items = vec![0u8; 3];
        parallel_for_mut(16, &mut items, |_, item, _| *item = 1);
        assert_eq!(items, vec![1, 1, 1]);
    }

    #[test]
    fn parallel_map_chunks_covers_all_items() {
        let items: Vec<u64> = (0..1234).collect();
        let partials = parallel_map_chunks(5, &items, |chunk, _tid| chunk.iter().sum::<u64>());
        let total: u64 = partials.iter().sum();
        assert_eq!(total, 1234 * 1233 / 2);
    }

    #[test]
    fn pipeline_preserves_block_order_at_every_depth() {
        for depth in 1..=3 {
            let mut next = 0u32;
            let mut seen = Vec::new();
            let calls = AtomicUsize::new(0);
            pipeline(
                depth,
                || {
                    if next == 50 {
                        return Ok(None);
                    }
                    next += 1;
                    Ok(Some(next))
                },
                |block| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    block * 10
                },
                |x| seen.push(x),
            )
            .unwrap();
            assert_eq!(calls.load(Ordering::Relaxed), 50);
            assert_eq!(seen, (1..=50).map(|i| i * 10).collect::<Vec<u32>>(), "depth={}", depth);
        }
    }

    #[test]
    fn pipeline_propagates_read_errors() {
        let mut n = 0;
        let result = pipeline(
            3,
            || {
                n += 1;
                if n > 3 {
                    return Err(anyhow!("stream broke"));
                }
                Ok(Some(n))
            },
            |block| block,
            |_| {},
        );
        assert!(result.is_err());
    }
}
